//! Scheduler: runs a plan one job at a time until nothing is left.
//!
//! Each iteration selects the next eligible job, moves it to `RUNNING`,
//! awaits the executor, and folds the result back through the state machine.
//! The state file is saved after every mutation, so a crash at any point
//! leaves a state a later run can resume from.

pub mod retry;
pub mod select;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::executor::{ExecutionResult, JobExecutor, JobRequest};
use crate::plan::PlanGraph;
use crate::state::dispatch;
use crate::state::queries::{self, Progress};
use crate::state::{
    ExecutionState, JobRef, JobStateMachine, JobStatus, StateError, StateStore, TransitionError,
    sync_from_plan,
};

pub use retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
pub use select::{ResolutionError, Selection, reconcile_blocked, resolve, select_next_job};

/// Errors that stop a scheduler run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("job {job} failed {retry_count} time(s) and is now BLOCKED; last error: {last_error}")]
    RetriesExhausted {
        job: JobRef,
        retry_count: u32,
        last_error: String,
    },

    #[error("module {0:?} not found in state")]
    UnknownModule(String),
}

/// How a run ended, when it did not end in an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalStatus {
    /// Every job is `COMPLETED`.
    Completed,
    /// Work remains but no job is eligible.
    NoEligibleJob {
        module: String,
        waiting: Vec<JobRef>,
        stuck: Vec<JobRef>,
    },
    /// The cancellation token fired between jobs.
    Interrupted,
}

/// Result of [`Scheduler::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Jobs that reached `COMPLETED` during this run.
    pub jobs_completed: usize,
    pub final_status: FinalStatus,
    pub progress: Progress,
}

/// Drives a [`JobExecutor`] over a plan, persisting through a [`StateStore`].
pub struct Scheduler {
    executor: Arc<dyn JobExecutor>,
    store: StateStore,
    policy: RetryPolicy,
    machine: JobStateMachine,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>, store: StateStore, policy: RetryPolicy) -> Self {
        Self {
            executor,
            store,
            machine: JobStateMachine::new(policy.max_retries),
            policy,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Load (or create) the state for `graph`, sync it, and recover jobs an
    /// interrupted run left behind: `RUNNING` jobs are requeued, and `FAILED`
    /// jobs are retried or blocked depending on their retry budget. The
    /// result is saved.
    ///
    /// A corrupt state file is an error; it is never replaced here.
    pub fn prepare(&self, graph: &PlanGraph) -> Result<ExecutionState, SchedulerError> {
        let existing = self.store.load_optional()?;
        let mut state = sync_from_plan(graph, existing.as_ref());

        for job in queries::jobs_with_status(&state, JobStatus::Running) {
            tracing::warn!(job = %job, "found job RUNNING at startup, treating it as interrupted");
            dispatch::requeue_job(&self.machine, &mut state, &job)?;
        }

        // A run killed during retry backoff leaves its job FAILED.
        for job in queries::jobs_with_status(&state, JobStatus::Failed) {
            let retry_count = state.job(&job).map_or(0, |j| j.retry_count);
            if retry_count < self.policy.max_retries {
                tracing::warn!(job = %job, retry_count, "found job FAILED at startup, retrying it");
                dispatch::retry_job(&self.machine, &mut state, &job)?;
            } else {
                tracing::warn!(job = %job, retry_count, "found job FAILED at startup with no retries left");
                dispatch::exhaust_job(&self.machine, &mut state, &job)?;
            }
        }

        self.store.save(&state)?;
        Ok(state)
    }

    /// Run jobs until the plan completes, nothing is eligible, the token is
    /// cancelled, or a job exhausts its retries.
    ///
    /// Cancellation is only observed between jobs and during retry backoff;
    /// a job that has started is always awaited.
    pub async fn run(
        &self,
        graph: &PlanGraph,
        cancel: CancellationToken,
    ) -> Result<Summary, SchedulerError> {
        let mut state = self.prepare(graph)?;
        let mut jobs_completed = 0;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(jobs_completed, "scheduler cancelled between jobs");
                return Ok(self.summary(&state, jobs_completed, FinalStatus::Interrupted));
            }

            if reconcile_blocked(graph, &mut state, &self.machine)? > 0 {
                self.store.save(&state)?;
            }

            let job = match select_next_job(graph, &state) {
                Selection::Job(job) => job,
                Selection::AllCompleted => {
                    tracing::info!(jobs_completed, "all jobs completed");
                    return Ok(self.summary(&state, jobs_completed, FinalStatus::Completed));
                }
                Selection::NoEligibleJob {
                    module,
                    waiting,
                    stuck,
                } => {
                    tracing::warn!(
                        module = %module,
                        waiting = waiting.len(),
                        stuck = stuck.len(),
                        "no eligible job"
                    );
                    let status = FinalStatus::NoEligibleJob {
                        module,
                        waiting,
                        stuck,
                    };
                    return Ok(self.summary(&state, jobs_completed, status));
                }
            };

            if self.run_job(graph, &mut state, &job, &cancel).await? {
                jobs_completed += 1;
            }
        }
    }

    /// Run one selected job through the executor. Returns `true` if it
    /// completed.
    async fn run_job(
        &self,
        graph: &PlanGraph,
        state: &mut ExecutionState,
        job: &JobRef,
        cancel: &CancellationToken,
    ) -> Result<bool, SchedulerError> {
        dispatch::start_job(&self.machine, state, job)?;
        self.store.save(state)?;

        let request = self.build_request(graph, state, job)?;
        tracing::info!(
            job = %job,
            attempt = request.attempt,
            tasks = request.tasks.len(),
            executor = self.executor.name(),
            "starting job"
        );

        let result = match self.executor.execute(&request).await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failed(request.tasks_completed, format!("{err:#}")),
        };

        let entry = state
            .job_mut(job)
            .ok_or_else(|| TransitionError::UnknownJob(job.clone()))?;
        entry.record_task_progress(result.tasks_completed, Utc::now());
        let (done, total) = (entry.tasks_completed, entry.tasks_total);

        if result.success && done == total {
            dispatch::complete_job(&self.machine, state, job)?;
            self.store.save(state)?;
            tracing::info!(job = %job, "job completed");
            return Ok(true);
        }

        let reason = match result.error {
            Some(err) if !result.success => err,
            _ => format!("completion not verified: {done}/{total} tasks completed"),
        };
        dispatch::fail_job(&self.machine, state, job, reason.clone())?;
        self.store.save(state)?;

        let retry_count = state.job(job).map_or(0, |j| j.retry_count);
        if retry_count < self.policy.max_retries {
            let delay = self.policy.delay_for(retry_count);
            tracing::warn!(
                job = %job,
                retry_count,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "job failed, will retry"
            );
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            dispatch::retry_job(&self.machine, state, job)?;
            self.store.save(state)?;
            return Ok(false);
        }

        dispatch::exhaust_job(&self.machine, state, job)?;
        self.store.save(state)?;
        tracing::error!(
            job = %job,
            retry_count,
            error = %reason,
            "job exhausted its retries, stopping run"
        );
        Err(SchedulerError::RetriesExhausted {
            job: job.clone(),
            retry_count,
            last_error: reason,
        })
    }

    fn build_request(
        &self,
        graph: &PlanGraph,
        state: &ExecutionState,
        job: &JobRef,
    ) -> Result<JobRequest, SchedulerError> {
        let entry = state
            .job(job)
            .ok_or_else(|| TransitionError::UnknownJob(job.clone()))?;
        let module = graph.module(&job.module);
        let plan_job = module.and_then(|m| m.job(&job.job));
        Ok(JobRequest {
            module: job.module.clone(),
            module_display_name: module.and_then(|m| m.display_name.clone()),
            job: job.job.clone(),
            job_index: entry.index,
            tasks: plan_job
                .map(|j| j.tasks.iter().map(|t| t.description.clone()).collect())
                .unwrap_or_default(),
            tasks_completed: entry.tasks_completed,
            attempt: entry.loop_count,
            retry_count: entry.retry_count,
            max_retries: self.policy.max_retries,
        })
    }

    fn summary(
        &self,
        state: &ExecutionState,
        jobs_completed: usize,
        final_status: FinalStatus,
    ) -> Summary {
        Summary {
            jobs_completed,
            final_status,
            progress: queries::progress(state),
        }
    }

    // -----------------------------------------------------------------------
    // Explicit restart
    // -----------------------------------------------------------------------

    /// Reset one job (and its tasks) to `PENDING`, clearing its counters.
    pub fn reset(&self, module: &str, job: &str) -> Result<(), SchedulerError> {
        let mut state = self.store.load()?;
        self.machine.reset(&mut state, &JobRef::new(module, job))?;
        self.store.save(&state)?;
        Ok(())
    }

    /// Reset every job in `module`. Returns the number of jobs reset.
    pub fn reset_module(&self, module: &str) -> Result<usize, SchedulerError> {
        let mut state = self.store.load()?;
        let jobs: Vec<JobRef> = state
            .module(module)
            .ok_or_else(|| SchedulerError::UnknownModule(module.to_owned()))?
            .jobs
            .iter()
            .map(|j| JobRef::new(module, &j.name))
            .collect();
        for job in &jobs {
            self.machine.reset(&mut state, job)?;
        }
        self.store.save(&state)?;
        Ok(jobs.len())
    }

    /// Reset every job in the state. Returns the number of jobs reset.
    pub fn reset_all(&self) -> Result<usize, SchedulerError> {
        let mut state = self.store.load()?;
        let jobs: Vec<JobRef> = state
            .jobs()
            .map(|(m, j)| JobRef::new(&m.name, &j.name))
            .collect();
        for job in &jobs {
            self.machine.reset(&mut state, job)?;
        }
        self.store.save(&state)?;
        tracing::info!(jobs = jobs.len(), "reset all jobs");
        Ok(jobs.len())
    }
}
