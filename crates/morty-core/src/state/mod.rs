//! Job state machine transitions.
//!
//! Validates and applies state transitions for jobs held in an
//! [`ExecutionState`], enforcing the allowed transition graph, the retry
//! guards, counter updates and the in-flight pointer.

pub mod dispatch;
pub mod model;
pub mod queries;
pub mod store;
pub mod sync;

use chrono::Utc;
use thiserror::Error;

pub use model::{
    BlockCause, ExecutionState, GlobalState, JobRef, JobState, JobStatus, JobStatusParseError,
    ModuleState, STATE_VERSION, TaskState, TaskStatus, derive_module_status,
};
pub use queries::Progress;
pub use store::{StateError, StateStore};
pub use sync::sync_from_plan;

/// Errors raised by [`JobStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid state transition: {from} -> {to} for job {job}")]
    Invalid {
        job: JobRef,
        from: JobStatus,
        to: JobStatus,
    },

    #[error(
        "invalid state transition: {from} -> {to} for job {job} \
         (retry_count {retry_count}, max_retries {max_retries})"
    )]
    RetryGuard {
        job: JobRef,
        from: JobStatus,
        to: JobStatus,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("cannot start job {job}: job {running} is already RUNNING")]
    AlreadyRunning { job: JobRef, running: JobRef },

    #[error("job {0} not found in state")]
    UnknownJob(JobRef),
}

/// The job state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// PENDING   -> RUNNING    (selected, prerequisites satisfied)
/// PENDING   -> BLOCKED    (prerequisite cannot be resolved)
/// RUNNING   -> COMPLETED  (success, all tasks done)
/// RUNNING   -> FAILED     (executor failure)
/// RUNNING   -> PENDING    (interrupted run recovered, or reset)
/// FAILED    -> PENDING    (retry, retry_count < max_retries)
/// FAILED    -> BLOCKED    (retry_count >= max_retries)
/// BLOCKED   -> PENDING    (blocking condition resolved)
/// COMPLETED -> PENDING    (restart)
/// ```
///
/// Entering `RUNNING` increments `loop_count` and sets the current pointer;
/// leaving `RUNNING` clears it. Entering `FAILED` increments `retry_count`.
/// Every transition stamps `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStateMachine {
    max_retries: u32,
}

impl JobStateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph. Retry guards are not considered.
    pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
        matches!(
            (from, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Blocked)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Pending)
                | (JobStatus::Failed, JobStatus::Pending)
                | (JobStatus::Failed, JobStatus::Blocked)
                | (JobStatus::Blocked, JobStatus::Pending)
                | (JobStatus::Completed, JobStatus::Pending)
        )
    }

    /// Legal targets from `from`, in declaration order.
    pub fn valid_transitions(from: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|&to| Self::is_valid_transition(from, to))
            .collect()
    }

    /// Check the edge plus the retry guards for a job with `retry_count`.
    pub fn check(
        &self,
        job: &JobRef,
        from: JobStatus,
        to: JobStatus,
        retry_count: u32,
    ) -> Result<(), TransitionError> {
        if !Self::is_valid_transition(from, to) {
            return Err(TransitionError::Invalid {
                job: job.clone(),
                from,
                to,
            });
        }
        let guard_ok = match (from, to) {
            (JobStatus::Failed, JobStatus::Pending) => retry_count < self.max_retries,
            (JobStatus::Failed, JobStatus::Blocked) => retry_count >= self.max_retries,
            _ => true,
        };
        if !guard_ok {
            return Err(TransitionError::RetryGuard {
                job: job.clone(),
                from,
                to,
                retry_count,
                max_retries: self.max_retries,
            });
        }
        Ok(())
    }

    /// Execute a state transition on `state`.
    ///
    /// Returns an error if the job does not exist, if the edge is not in the
    /// graph, if a retry guard rejects it, or if it would start a second
    /// `RUNNING` job. The state is untouched on error.
    pub fn transition(
        &self,
        state: &mut ExecutionState,
        job: &JobRef,
        to: JobStatus,
    ) -> Result<(), TransitionError> {
        let now = Utc::now();
        let running = if to == JobStatus::Running {
            other_running_job(state, job)
        } else {
            None
        };
        let entry = state
            .job_mut(job)
            .ok_or_else(|| TransitionError::UnknownJob(job.clone()))?;
        let from = entry.status;

        let checked = self.check(job, from, to, entry.retry_count).and_then(|()| match running {
            Some(running) => Err(TransitionError::AlreadyRunning {
                job: job.clone(),
                running,
            }),
            None => Ok(()),
        });
        if let Err(err) = checked {
            tracing::error!(job = %job, %from, %to, error = %err, "rejected job transition");
            return Err(err);
        }

        entry.status = to;
        entry.updated_at = now;
        match to {
            JobStatus::Running => {
                entry.loop_count += 1;
                entry.blocked_by = None;
            }
            JobStatus::Failed => entry.retry_count += 1,
            JobStatus::Completed => entry.failure_reason = None,
            JobStatus::Pending => entry.blocked_by = None,
            JobStatus::Blocked => {}
        }

        if to == JobStatus::Running {
            state.global.set_current(job.clone());
        } else if from == JobStatus::Running {
            state.global.clear_current();
        }

        touch(state, &job.module);
        tracing::debug!(job = %job, %from, %to, "job transition");
        Ok(())
    }

    /// Put a job and its tasks back to `PENDING` with counters cleared.
    ///
    /// Works from any status and bypasses the retry guards. A `RUNNING` job
    /// releases the current pointer.
    pub fn reset(&self, state: &mut ExecutionState, job: &JobRef) -> Result<(), TransitionError> {
        let now = Utc::now();
        let entry = state
            .job_mut(job)
            .ok_or_else(|| TransitionError::UnknownJob(job.clone()))?;
        let from = entry.status;
        entry.clear_progress();
        entry.updated_at = now;

        if from == JobStatus::Running || state.global.current.as_ref() == Some(job) {
            state.global.clear_current();
        }
        touch(state, &job.module);
        tracing::info!(job = %job, %from, "job reset to PENDING");
        Ok(())
    }
}

/// The job other than `job` that holds the current pointer or is `RUNNING`.
fn other_running_job(state: &ExecutionState, job: &JobRef) -> Option<JobRef> {
    if let Some(current) = &state.global.current {
        if current != job {
            return Some(current.clone());
        }
    }
    state
        .jobs()
        .find(|(m, j)| j.status == JobStatus::Running && (m.name != job.module || j.name != job.job))
        .map(|(m, j)| JobRef::new(&m.name, &j.name))
}

/// Stamp the owning module and the global block, and refresh derived fields.
fn touch(state: &mut ExecutionState, module: &str) {
    let now = Utc::now();
    if let Some(m) = state.module_mut(module) {
        m.updated_at = now;
    }
    state.global.last_update = now;
    state.refresh_derived();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_are_exactly_the_table() {
        use JobStatus::*;
        assert_eq!(JobStateMachine::valid_transitions(Pending), vec![Running, Blocked]);
        assert_eq!(
            JobStateMachine::valid_transitions(Running),
            vec![Pending, Completed, Failed]
        );
        assert_eq!(JobStateMachine::valid_transitions(Completed), vec![Pending]);
        assert_eq!(JobStateMachine::valid_transitions(Failed), vec![Pending, Blocked]);
        assert_eq!(JobStateMachine::valid_transitions(Blocked), vec![Pending]);
    }

    #[test]
    fn no_self_transitions() {
        for status in JobStatus::ALL {
            assert!(!JobStateMachine::is_valid_transition(status, status));
        }
    }

    #[test]
    fn retry_guard_boundaries() {
        let sm = JobStateMachine::new(3);
        let job = JobRef::new("m", "j");
        sm.check(&job, JobStatus::Failed, JobStatus::Pending, 2).unwrap();
        assert!(matches!(
            sm.check(&job, JobStatus::Failed, JobStatus::Pending, 3),
            Err(TransitionError::RetryGuard { .. })
        ));
        sm.check(&job, JobStatus::Failed, JobStatus::Blocked, 3).unwrap();
        assert!(matches!(
            sm.check(&job, JobStatus::Failed, JobStatus::Blocked, 2),
            Err(TransitionError::RetryGuard { .. })
        ));
    }

    #[test]
    fn unknown_job_is_an_error() {
        let sm = JobStateMachine::new(3);
        let mut state = ExecutionState::new(Utc::now());
        let job = JobRef::new("nope", "nada");
        assert_eq!(
            sm.transition(&mut state, &job, JobStatus::Running),
            Err(TransitionError::UnknownJob(job.clone()))
        );
        assert_eq!(
            sm.reset(&mut state, &job),
            Err(TransitionError::UnknownJob(job))
        );
    }
}
