//! Read-only views over an [`ExecutionState`] for status reporting.

use serde::Serialize;

use super::{ExecutionState, JobRef, JobStatus};

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl Progress {
    /// Completed jobs as a percentage of all jobs. An empty plan is 100%.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }
}

/// Count jobs by status.
pub fn progress(state: &ExecutionState) -> Progress {
    let mut p = Progress::default();
    for (_, job) in state.jobs() {
        p.total += 1;
        match job.status {
            JobStatus::Pending => p.pending += 1,
            JobStatus::Running => p.running += 1,
            JobStatus::Completed => p.completed += 1,
            JobStatus::Failed => p.failed += 1,
            JobStatus::Blocked => p.blocked += 1,
        }
    }
    p
}

/// Every job currently in `status`, in execution order.
pub fn jobs_with_status(state: &ExecutionState, status: JobStatus) -> Vec<JobRef> {
    state
        .jobs()
        .filter(|(_, j)| j.status == status)
        .map(|(m, j)| JobRef::new(&m.name, &j.name))
        .collect()
}

/// `true` when every job is `COMPLETED`.
pub fn is_complete(state: &ExecutionState) -> bool {
    state.jobs().all(|(_, j)| j.status == JobStatus::Completed)
}
