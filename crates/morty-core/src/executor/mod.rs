//! Job executor interface.
//!
//! The scheduler hands one job at a time to a [`JobExecutor`] and folds the
//! returned [`ExecutionResult`] into the state machine. How the work gets
//! done (an agent subprocess, a remote call, a test double) is up to the
//! implementation.

pub mod command;

use anyhow::Result;
use async_trait::async_trait;

pub use command::CommandExecutor;

/// Everything an executor needs to know about the job it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub module: String,
    pub module_display_name: Option<String>,
    pub job: String,
    /// 1-based declared position within the module.
    pub job_index: usize,
    /// Task descriptions, in order.
    pub tasks: Vec<String>,
    /// Tasks already completed by earlier attempts.
    pub tasks_completed: usize,
    /// Number of times this job has been started, including this one.
    pub attempt: u32,
    /// Failures so far.
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Outcome reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    /// Leading tasks known to be done after this attempt.
    pub tasks_completed: usize,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(tasks_completed: usize) -> Self {
        Self {
            success: true,
            tasks_completed,
            error: None,
        }
    }

    pub fn failed(tasks_completed: usize, error: impl Into<String>) -> Self {
        Self {
            success: false,
            tasks_completed,
            error: Some(error.into()),
        }
    }
}

/// Runs a single job to completion.
///
/// Returning `Err` is treated like a failed [`ExecutionResult`] with no new
/// task progress. The scheduler imposes no timeout; implementations own that
/// policy.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn execute(&self, request: &JobRequest) -> Result<ExecutionResult>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn JobExecutor) {}
};
