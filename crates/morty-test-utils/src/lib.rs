//! Shared test utilities for morty integration tests.
//!
//! - [`ScriptedExecutor`]: a [`JobExecutor`] whose outcomes are scripted per
//!   job and which records every request it receives.
//! - [`PlanBuilder`]: compact construction of plan graphs and plan
//!   directories.
//! - [`TestWorkspace`]: a temp directory holding a state file path.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use morty_core::executor::{ExecutionResult, JobExecutor, JobRequest};
use morty_core::plan::{
    GraphOptions, JobRecord, ModuleRecord, PlanGraph, TaskRecord, build_graph,
};
use morty_core::state::StateStore;

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// One scripted executor outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Success with every task completed.
    Succeed,
    /// Failure with the given error and no new progress.
    Fail(String),
    /// Report success but only `n` tasks completed.
    Partial(usize),
    /// The executor itself errors.
    Error(String),
}

/// A [`JobExecutor`] that replays scripted outcomes.
///
/// Outcomes are queued per job name; once a job's queue is empty it
/// succeeds. Optionally cancels a token after a number of calls so tests
/// can exercise cancellation at the job boundary.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<JobRequest>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `outcomes` for the job named `job` (any module).
    pub fn script(self, job: &str, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(job.to_owned())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Fail `job` the next `times` attempts.
    pub fn fail_times(self, job: &str, times: usize) -> Self {
        let outcomes = (0..times).map(|i| Outcome::Fail(format!("scripted failure {}", i + 1)));
        self.script(job, outcomes)
    }

    /// Cancel `token` once `calls` executions have finished.
    pub fn cancel_after(self, calls: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((calls, token));
        self
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<JobRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// `module/job` names of every request received, in order.
    pub fn call_names(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|r| format!("{}/{}", r.module, r.job))
            .collect()
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &JobRequest) -> Result<ExecutionResult> {
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.job)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Succeed);

        let call_count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if call_count >= *after {
                token.cancel();
            }
        }

        match outcome {
            Outcome::Succeed => Ok(ExecutionResult::succeeded(request.tasks.len())),
            Outcome::Fail(msg) => Ok(ExecutionResult::failed(request.tasks_completed, msg)),
            Outcome::Partial(n) => Ok(ExecutionResult {
                success: true,
                tasks_completed: n,
                error: None,
            }),
            Outcome::Error(msg) => bail!(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// PlanBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for plan records.
///
/// ```ignore
/// let graph = PlanBuilder::new()
///     .module("core", &[])
///     .job("parse", &[], 2)
///     .module("cli", &["core"])
///     .job("wire", &["core:job_1"], 1)
///     .build();
/// ```
#[derive(Debug, Default, Clone)]
pub struct PlanBuilder {
    modules: Vec<ModuleRecord>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new module.
    pub fn module(mut self, name: &str, dependencies: &[&str]) -> Self {
        self.modules.push(ModuleRecord {
            name: name.to_owned(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        });
        self
    }

    /// Add a job with `tasks` generated task descriptions to the last module.
    pub fn job(mut self, name: &str, prerequisites: &[&str], tasks: usize) -> Self {
        let job = JobRecord {
            name: name.to_owned(),
            prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
            tasks: (1..=tasks)
                .map(|i| TaskRecord::new(format!("{name} task {i}")))
                .collect(),
        };
        if let Some(module) = self.modules.last_mut() {
            module.jobs.push(job);
        }
        self
    }

    pub fn records(&self) -> Vec<ModuleRecord> {
        self.modules.clone()
    }

    /// Build a graph with no required module.
    pub fn build(&self) -> PlanGraph {
        build_graph(self.records(), &GraphOptions::permissive()).expect("test plan should build")
    }

    /// Write one `<module>.toml` per module into `dir`.
    pub fn write_dir(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        for module in &self.modules {
            std::fs::write(dir.join(format!("{}.toml", module.name)), module_toml(module))?;
        }
        Ok(())
    }
}

fn module_toml(module: &ModuleRecord) -> String {
    let quote = |items: &[String]| {
        items
            .iter()
            .map(|s| format!("{s:?}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut out = format!(
        "[module]\nname = {:?}\ndependencies = [{}]\n",
        module.name,
        quote(&module.dependencies)
    );
    for job in &module.jobs {
        let tasks: Vec<String> = job.tasks.iter().map(|t| t.description.clone()).collect();
        out.push_str(&format!(
            "\n[[jobs]]\nname = {:?}\nprerequisites = [{}]\ntasks = [{}]\n",
            job.name,
            quote(&job.prerequisites),
            quote(&tasks)
        ));
    }
    out
}

/// The seed plan: `quicksort_core`, `file_handler` (after quicksort_core)
/// and `cli` (after both), one job and one task each.
pub fn seed_plan() -> PlanBuilder {
    PlanBuilder::new()
        .module("cli", &["quicksort_core", "file_handler"])
        .job("wire up cli", &[], 1)
        .module("file_handler", &["quicksort_core"])
        .job("read and write files", &[], 1)
        .module("quicksort_core", &[])
        .job("implement quicksort", &[], 1)
}

// ---------------------------------------------------------------------------
// TestWorkspace
// ---------------------------------------------------------------------------

/// A temp directory with a state file path at `.morty/status.json`.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join(".morty").join("status.json")
    }

    pub fn plan_dir(&self) -> PathBuf {
        self.dir.path().join(".morty").join("plan")
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.state_path())
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
