//! Convenience helpers that wrap [`super::JobStateMachine`] transitions
//! with semantic names and the bookkeeping each edge carries.

use super::{BlockCause, ExecutionState, JobRef, JobStateMachine, JobStatus, TransitionError};

/// Start a job: transition `PENDING -> RUNNING`.
///
/// Increments `loop_count` and points the global current job at it.
pub fn start_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Running)
}

/// Mark a job as completed: transition `RUNNING -> COMPLETED`.
pub fn complete_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Completed)
}

/// Mark a job as failed: transition `RUNNING -> FAILED`.
///
/// Increments `retry_count` and records `reason`.
pub fn fail_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
    reason: impl Into<String>,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Failed)?;
    if let Some(entry) = state.job_mut(job) {
        entry.failure_reason = Some(reason.into());
    }
    Ok(())
}

/// Retry a failed job: transition `FAILED -> PENDING`.
///
/// Fails if `retry_count >= max_retries`.
pub fn retry_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Pending)
}

/// Give up on a failed job: transition `FAILED -> BLOCKED`.
///
/// Fails if `retry_count < max_retries`.
pub fn exhaust_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Blocked)?;
    set_block_cause(state, job, BlockCause::RetriesExhausted);
    Ok(())
}

/// Block a pending job whose prerequisites cannot be resolved:
/// transition `PENDING -> BLOCKED`.
pub fn block_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
    reason: impl Into<String>,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Blocked)?;
    set_block_cause(state, job, BlockCause::UnresolvedPrerequisite);
    if let Some(entry) = state.job_mut(job) {
        entry.failure_reason = Some(reason.into());
    }
    Ok(())
}

/// Release a blocked job: transition `BLOCKED -> PENDING`.
pub fn unblock_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Pending)?;
    if let Some(entry) = state.job_mut(job) {
        entry.failure_reason = None;
    }
    Ok(())
}

/// Return an interrupted job to the queue: transition `RUNNING -> PENDING`.
///
/// Counters are kept; the next start increments `loop_count` again.
pub fn requeue_job(
    sm: &JobStateMachine,
    state: &mut ExecutionState,
    job: &JobRef,
) -> Result<(), TransitionError> {
    sm.transition(state, job, JobStatus::Pending)
}

fn set_block_cause(state: &mut ExecutionState, job: &JobRef, cause: BlockCause) {
    if let Some(entry) = state.job_mut(job) {
        entry.blocked_by = Some(cause);
    }
}
