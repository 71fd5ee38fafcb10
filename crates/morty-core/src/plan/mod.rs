//! Plan graph: modules, jobs, tasks and their dependency edges.

pub mod graph;
pub mod loader;
pub mod model;
pub mod prerequisite;
pub mod toml_format;

pub use graph::{DEFAULT_REQUIRED_MODULE, GraphError, GraphOptions, PlanGraph, build_graph};
pub use loader::{PlanLoadError, load_plan_dir, read_plan_dir};
pub use model::{ALL_MODULES, Job, JobRecord, Module, ModuleRecord, Task, TaskRecord};
pub use prerequisite::{Prerequisite, PrerequisiteParseError};
pub use toml_format::{JobToml, ModuleMeta, ModuleToml};
