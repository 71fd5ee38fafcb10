//! Core of morty: the plan graph, persisted execution state, the job state
//! machine and the scheduler that drives an agent through a plan.

pub mod executor;
pub mod plan;
pub mod scheduler;
pub mod state;
pub mod topo;

pub use executor::{CommandExecutor, ExecutionResult, JobExecutor, JobRequest};
pub use plan::{GraphError, GraphOptions, PlanGraph, build_graph, load_plan_dir};
pub use scheduler::{FinalStatus, RetryPolicy, Scheduler, SchedulerError, Selection, Summary};
pub use state::{ExecutionState, JobRef, JobStateMachine, JobStatus, StateError, StateStore};
