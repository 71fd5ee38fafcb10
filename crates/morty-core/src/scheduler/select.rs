//! Job selection and prerequisite resolution.
//!
//! Everything here is a pure function of the plan graph and the state, so
//! calling [`select_next_job`] twice without mutating the state returns the
//! same answer.

use thiserror::Error;

use crate::plan::{Job, Module, PlanGraph, Prerequisite};
use crate::state::dispatch;
use crate::state::{
    BlockCause, ExecutionState, JobRef, JobStateMachine, JobStatus, TransitionError,
};

/// A prerequisite that cannot be resolved to a tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("job {job} requires {reference}, but module {module:?} is not in the plan")]
    UnknownModule {
        job: JobRef,
        reference: Prerequisite,
        module: String,
    },

    #[error("job {job} requires {reference}, but module {module:?} has no job at that index")]
    UnknownIndex {
        job: JobRef,
        reference: Prerequisite,
        module: String,
    },

    #[error("job {job} requires {reference} ({target}), which is not tracked in state")]
    Untracked {
        job: JobRef,
        reference: Prerequisite,
        target: JobRef,
    },
}

/// Outcome of [`select_next_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The next job to run.
    Job(JobRef),
    /// Every job is `COMPLETED`.
    AllCompleted,
    /// Work remains but nothing can run right now.
    NoEligibleJob {
        /// The first module that is not completed.
        module: String,
        /// Jobs in that module that are `PENDING` but waiting on prerequisites.
        waiting: Vec<JobRef>,
        /// Jobs in that module that are `BLOCKED` or `FAILED`.
        stuck: Vec<JobRef>,
    },
}

/// Translate a prerequisite held by `owner` into the referenced job's name,
/// by declared index in the referenced module.
pub fn resolve(
    graph: &PlanGraph,
    owner: &JobRef,
    prerequisite: &Prerequisite,
) -> Result<JobRef, ResolutionError> {
    let module_name = prerequisite.module(&owner.module);
    let module = graph
        .module(module_name)
        .ok_or_else(|| ResolutionError::UnknownModule {
            job: owner.clone(),
            reference: prerequisite.clone(),
            module: module_name.to_owned(),
        })?;
    let job = module
        .job_by_number(prerequisite.index())
        .ok_or_else(|| ResolutionError::UnknownIndex {
            job: owner.clone(),
            reference: prerequisite.clone(),
            module: module_name.to_owned(),
        })?;
    Ok(JobRef::new(&module.name, &job.name))
}

/// Resolve a prerequisite and look up its current status.
pub fn prerequisite_status(
    graph: &PlanGraph,
    state: &ExecutionState,
    owner: &JobRef,
    prerequisite: &Prerequisite,
) -> Result<JobStatus, ResolutionError> {
    let target = resolve(graph, owner, prerequisite)?;
    state
        .job(&target)
        .map(|j| j.status)
        .ok_or_else(|| ResolutionError::Untracked {
            job: owner.clone(),
            reference: prerequisite.clone(),
            target,
        })
}

/// `Ok(true)` when every prerequisite of `job` is `COMPLETED`.
fn prerequisites_met(
    graph: &PlanGraph,
    state: &ExecutionState,
    module: &Module,
    job: &Job,
) -> Result<bool, ResolutionError> {
    let owner = JobRef::new(&module.name, &job.name);
    for prerequisite in &job.prerequisites {
        if prerequisite_status(graph, state, &owner, prerequisite)? != JobStatus::Completed {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Pick the next job to run.
///
/// Walks modules in execution order to the first one that is not fully
/// completed, then returns its first `PENDING` job (in job order) whose
/// prerequisites are all `COMPLETED`. Jobs with unresolvable prerequisites
/// are never eligible.
pub fn select_next_job(graph: &PlanGraph, state: &ExecutionState) -> Selection {
    for module in graph.modules() {
        let module_done = module.jobs.iter().all(|job| {
            state.query(&module.name, &job.name) == Some(JobStatus::Completed)
        });
        if module_done {
            continue;
        }

        let mut waiting = Vec::new();
        let mut stuck = Vec::new();
        for job in module.sorted_jobs() {
            let job_ref = JobRef::new(&module.name, &job.name);
            match state.query(&module.name, &job.name) {
                Some(JobStatus::Pending) => {
                    if matches!(prerequisites_met(graph, state, module, job), Ok(true)) {
                        return Selection::Job(job_ref);
                    }
                    waiting.push(job_ref);
                }
                Some(JobStatus::Completed) => {}
                Some(JobStatus::Running) => waiting.push(job_ref),
                Some(JobStatus::Blocked | JobStatus::Failed) | None => stuck.push(job_ref),
            }
        }
        return Selection::NoEligibleJob {
            module: module.name.clone(),
            waiting,
            stuck,
        };
    }
    Selection::AllCompleted
}

/// Block `PENDING` jobs whose prerequisites cannot be resolved, and release
/// jobs blocked for that reason once they resolve again.
///
/// Returns the number of jobs that changed status.
pub fn reconcile_blocked(
    graph: &PlanGraph,
    state: &mut ExecutionState,
    sm: &JobStateMachine,
) -> Result<usize, TransitionError> {
    let mut changes = Vec::new();
    for module in graph.modules() {
        for job in &module.jobs {
            let job_ref = JobRef::new(&module.name, &job.name);
            let Some(entry) = state.job(&job_ref) else {
                continue;
            };
            let unresolved = job.prerequisites.iter().find_map(|p| {
                prerequisite_status(graph, state, &job_ref, p).err()
            });
            match (entry.status, entry.blocked_by, unresolved) {
                (JobStatus::Pending, _, Some(err)) => changes.push((job_ref, Some(err))),
                (JobStatus::Blocked, Some(BlockCause::UnresolvedPrerequisite), None) => {
                    changes.push((job_ref, None));
                }
                _ => {}
            }
        }
    }

    let count = changes.len();
    for (job_ref, unresolved) in changes {
        match unresolved {
            Some(err) => {
                tracing::warn!(job = %job_ref, error = %err, "blocking job on unresolved prerequisite");
                dispatch::block_job(sm, state, &job_ref, err.to_string())?;
            }
            None => {
                tracing::info!(job = %job_ref, "prerequisites resolved, unblocking job");
                dispatch::unblock_job(sm, state, &job_ref)?;
            }
        }
    }
    Ok(count)
}
