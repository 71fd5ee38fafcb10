//! Persisted execution state.
//!
//! The JSON layout is stable: struct field order fixes key order, and modules
//! and jobs are stored as sequences in execution order.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version written into every state file.
pub const STATE_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Status of a job. Modules and the overall run reuse it as a derived status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "BLOCKED" => Ok(Self::Blocked),
            _ => Err(JobStatusParseError(s.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------
// TaskStatus / BlockCause
// ---------------------------------------------------------------------------

/// Status of a single task. Only ever moves `Pending -> Completed`, except
/// when the owning job is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Completed,
}

/// Why a job is `BLOCKED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
    /// Failed `max_retries` times. Only a manual reset clears it.
    RetriesExhausted,
    /// A prerequisite could not be resolved against the state. Cleared
    /// automatically once the reference resolves again.
    UnresolvedPrerequisite,
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RetriesExhausted => "retries exhausted",
            Self::UnresolvedPrerequisite => "unresolved prerequisite",
        })
    }
}

// ---------------------------------------------------------------------------
// JobRef
// ---------------------------------------------------------------------------

/// A (module, job) name pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobRef {
    pub module: String,
    pub job: String,
}

impl JobRef {
    pub fn new(module: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            job: job.into(),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.job)
    }
}

// ---------------------------------------------------------------------------
// State tree
// ---------------------------------------------------------------------------

/// Top-level persisted state.
///
/// Modules are held in a sequence (execution order) plus a name index that
/// is rebuilt on load and whenever the module list is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StateFile")]
pub struct ExecutionState {
    pub version: String,
    pub global: GlobalState,
    modules: Vec<ModuleState>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

/// Deserialization shape of [`ExecutionState`]; converted so the index is
/// always built.
#[derive(Deserialize)]
struct StateFile {
    version: String,
    global: GlobalState,
    #[serde(default)]
    modules: Vec<ModuleState>,
}

impl From<StateFile> for ExecutionState {
    fn from(file: StateFile) -> Self {
        let mut state = Self {
            version: file.version,
            global: file.global,
            modules: Vec::new(),
            index: HashMap::new(),
        };
        state.set_modules(file.modules);
        state
    }
}

/// Run-wide status, counters and the in-flight job pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalState {
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// The job currently `RUNNING`, if any.
    #[serde(default)]
    pub current: Option<JobRef>,
    pub total_modules: usize,
    pub completed_modules: usize,
    pub total_jobs: usize,
    pub completed_jobs: usize,
}

impl GlobalState {
    pub fn set_current(&mut self, job: JobRef) {
        self.current = Some(job);
    }

    /// Clear the in-flight pointer. Never consults the referenced module.
    pub fn clear_current(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleState {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_file: Option<String>,
    /// Derived from the jobs; see [`derive_module_status`].
    pub status: JobStatus,
    /// Effective dependencies (wildcard expanded).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Jobs in execution order.
    #[serde(default)]
    pub jobs: Vec<JobState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleState {
    pub fn job(&self, name: &str) -> Option<&JobState> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut JobState> {
        self.jobs.iter_mut().find(|j| j.name == name)
    }

    pub fn is_completed(&self) -> bool {
        self.jobs.iter().all(|j| j.status == JobStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    /// 1-based declared position within the module (what `job_N` names).
    pub index: usize,
    /// 1-based position in the full execution sequence.
    pub global_index: usize,
    pub name: String,
    pub status: JobStatus,
    /// Normalized prerequisite references, for display.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    /// Times this job entered `RUNNING`.
    pub loop_count: u32,
    /// Times this job entered `FAILED`.
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<BlockCause>,
    #[serde(default)]
    pub tasks: Vec<TaskState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    /// Mark the first `count` tasks completed. Never un-completes a task.
    /// Returns `true` if any task changed.
    pub fn record_task_progress(&mut self, count: usize, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for task in self.tasks.iter_mut().take(count) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                changed = true;
            }
        }
        self.tasks_completed = self.count_completed_tasks();
        if changed {
            self.updated_at = now;
        }
        changed
    }

    pub fn count_completed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    /// Put the job and its tasks back to a fresh `PENDING` state.
    pub(crate) fn clear_progress(&mut self) {
        self.status = JobStatus::Pending;
        self.loop_count = 0;
        self.retry_count = 0;
        self.failure_reason = None;
        self.blocked_by = None;
        for task in &mut self.tasks {
            task.status = TaskStatus::Pending;
            task.completed_at = None;
        }
        self.tasks_completed = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// 0-based position within the job.
    pub index: usize,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ExecutionState accessors
// ---------------------------------------------------------------------------

impl ExecutionState {
    /// An empty state with no modules.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION.to_owned(),
            global: GlobalState {
                status: JobStatus::Pending,
                start_time: now,
                last_update: now,
                current: None,
                total_modules: 0,
                completed_modules: 0,
                total_jobs: 0,
                completed_jobs: 0,
            },
            modules: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Modules in execution order.
    pub fn modules(&self) -> &[ModuleState] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut [ModuleState] {
        &mut self.modules
    }

    /// Replace the module list and rebuild the name index.
    pub fn set_modules(&mut self, modules: Vec<ModuleState>) {
        self.index = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();
        self.modules = modules;
    }

    pub fn module(&self, name: &str) -> Option<&ModuleState> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut ModuleState> {
        self.index.get(name).map(|&i| &mut self.modules[i])
    }

    pub fn job(&self, job: &JobRef) -> Option<&JobState> {
        self.module(&job.module)?.job(&job.job)
    }

    pub fn job_mut(&mut self, job: &JobRef) -> Option<&mut JobState> {
        self.module_mut(&job.module)?.job_mut(&job.job)
    }

    /// Status of a job, or `None` if the state does not know it.
    pub fn query(&self, module: &str, job: &str) -> Option<JobStatus> {
        self.module(module)?.job(job).map(|j| j.status)
    }

    /// Iterate over every job with its module name, in execution order.
    pub fn jobs(&self) -> impl Iterator<Item = (&ModuleState, &JobState)> {
        self.modules
            .iter()
            .flat_map(|m| m.jobs.iter().map(move |j| (m, j)))
    }

    /// Recompute module statuses, global counters and global status.
    ///
    /// Returns `true` if anything changed.
    pub fn refresh_derived(&mut self) -> bool {
        let mut changed = false;
        for module in &mut self.modules {
            let status = derive_module_status(&module.jobs);
            if module.status != status {
                module.status = status;
                changed = true;
            }
        }

        let total_modules = self.modules.len();
        let completed_modules = self
            .modules
            .iter()
            .filter(|m| m.status == JobStatus::Completed)
            .count();
        let total_jobs = self.modules.iter().map(|m| m.jobs.len()).sum();
        let completed_jobs = self
            .jobs()
            .filter(|(_, j)| j.status == JobStatus::Completed)
            .count();
        let status = if self.global.current.is_some() {
            JobStatus::Running
        } else {
            derive_module_status(self.modules.iter().flat_map(|m| m.jobs.iter()))
        };

        let global = &mut self.global;
        if (
            global.total_modules,
            global.completed_modules,
            global.total_jobs,
            global.completed_jobs,
            global.status,
        ) != (
            total_modules,
            completed_modules,
            total_jobs,
            completed_jobs,
            status,
        ) {
            global.total_modules = total_modules;
            global.completed_modules = completed_modules;
            global.total_jobs = total_jobs;
            global.completed_jobs = completed_jobs;
            global.status = status;
            changed = true;
        }
        changed
    }

    /// Check the structural invariants of a loaded state.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != STATE_VERSION {
            return Err(format!(
                "unsupported state version {:?} (expected {STATE_VERSION:?})",
                self.version
            ));
        }

        if self.index.len() != self.modules.len() {
            return Err("duplicate module names".to_owned());
        }

        for module in &self.modules {
            let mut names = std::collections::HashSet::new();
            for job in &module.jobs {
                if !names.insert(job.name.as_str()) {
                    return Err(format!(
                        "duplicate job {:?} in module {:?}",
                        job.name, module.name
                    ));
                }
                if job.tasks_completed > job.tasks_total {
                    return Err(format!(
                        "job {:?} in module {:?} has tasks_completed {} > tasks_total {}",
                        job.name, module.name, job.tasks_completed, job.tasks_total
                    ));
                }
                if job.tasks_total != job.tasks.len() {
                    return Err(format!(
                        "job {:?} in module {:?} has tasks_total {} but {} task entries",
                        job.name,
                        module.name,
                        job.tasks_total,
                        job.tasks.len()
                    ));
                }
                let done = job.count_completed_tasks();
                if job.tasks_completed != done {
                    return Err(format!(
                        "job {:?} in module {:?} has tasks_completed {} but {} COMPLETED tasks",
                        job.name, module.name, job.tasks_completed, done
                    ));
                }
            }
        }

        let running: Vec<String> = self
            .jobs()
            .filter(|(_, j)| j.status == JobStatus::Running)
            .map(|(m, j)| format!("{}/{}", m.name, j.name))
            .collect();
        if running.len() > 1 {
            return Err(format!(
                "more than one job is RUNNING: {}",
                running.join(", ")
            ));
        }

        if let Some(current) = &self.global.current {
            match self.job(current) {
                Some(job) if job.status == JobStatus::Running => {}
                Some(job) => {
                    return Err(format!(
                        "current job {current} has status {}, expected RUNNING",
                        job.status
                    ));
                }
                None => return Err(format!("current job {current} does not exist")),
            }
        }

        Ok(())
    }
}

/// Status of a group of jobs: all completed -> `COMPLETED`, else the first
/// of `RUNNING`, `BLOCKED`, `FAILED` present, else `PENDING`.
pub fn derive_module_status<'a, I>(jobs: I) -> JobStatus
where
    I: IntoIterator<Item = &'a JobState>,
{
    let mut all_completed = true;
    let (mut running, mut blocked, mut failed) = (false, false, false);
    for job in jobs {
        match job.status {
            JobStatus::Completed => continue,
            JobStatus::Running => running = true,
            JobStatus::Blocked => blocked = true,
            JobStatus::Failed => failed = true,
            JobStatus::Pending => {}
        }
        all_completed = false;
    }
    if all_completed {
        JobStatus::Completed
    } else if running {
        JobStatus::Running
    } else if blocked {
        JobStatus::Blocked
    } else if failed {
        JobStatus::Failed
    } else {
        JobStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, status: JobStatus) -> JobState {
        let now = Utc::now();
        JobState {
            index: 1,
            global_index: 1,
            name: name.to_owned(),
            status,
            prerequisites: vec![],
            tasks_total: 2,
            tasks_completed: 0,
            loop_count: 0,
            retry_count: 0,
            failure_reason: None,
            blocked_by: None,
            tasks: (0..2)
                .map(|index| TaskState {
                    index,
                    description: format!("task {index}"),
                    status: TaskStatus::Pending,
                    completed_at: None,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn job_status_display_roundtrip() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!("blocked".parse::<JobStatus>().unwrap(), JobStatus::Blocked);
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn job_status_serializes_uppercase() {
        let json = serde_json::to_string(&JobStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }

    #[test]
    fn module_status_derivation() {
        use JobStatus::*;
        let derive = |s: &[JobStatus]| {
            let jobs: Vec<JobState> = s.iter().map(|&st| job("j", st)).collect();
            derive_module_status(&jobs)
        };
        assert_eq!(derive(&[]), Completed);
        assert_eq!(derive(&[Completed, Completed]), Completed);
        assert_eq!(derive(&[Completed, Running, Blocked]), Running);
        assert_eq!(derive(&[Failed, Blocked]), Blocked);
        assert_eq!(derive(&[Pending, Failed]), Failed);
        assert_eq!(derive(&[Pending, Completed]), Pending);
    }

    #[test]
    fn record_task_progress_never_uncompletes() {
        let mut j = job("j", JobStatus::Running);
        let now = Utc::now();
        assert!(j.record_task_progress(1, now));
        assert_eq!(j.tasks_completed, 1);
        assert!(!j.record_task_progress(0, now));
        assert_eq!(j.tasks_completed, 1);
        assert!(j.record_task_progress(10, now));
        assert_eq!(j.tasks_completed, 2);
    }

    #[test]
    fn index_is_rebuilt_on_deserialize() {
        let now = Utc::now();
        let mut state = ExecutionState::new(now);
        state.set_modules(vec![ModuleState {
            name: "core".to_owned(),
            display_name: None,
            plan_file: None,
            status: JobStatus::Pending,
            dependencies: vec![],
            jobs: vec![job("build", JobStatus::Pending)],
            created_at: now,
            updated_at: now,
        }]);
        let json = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.query("core", "build"), Some(JobStatus::Pending));
        assert_eq!(back, state);
    }

    #[test]
    fn validate_rejects_dangling_current_pointer() {
        let mut state = ExecutionState::new(Utc::now());
        state.global.set_current(JobRef::new("ghost", "job"));
        let err = state.validate().unwrap_err();
        assert!(err.contains("does not exist"), "got: {err}");
        state.global.clear_current();
        state.validate().unwrap();
    }

    fn state_with(jobs: Vec<JobState>) -> ExecutionState {
        let now = Utc::now();
        let mut state = ExecutionState::new(now);
        state.set_modules(vec![ModuleState {
            name: "core".to_owned(),
            display_name: None,
            plan_file: None,
            status: JobStatus::Pending,
            dependencies: vec![],
            jobs,
            created_at: now,
            updated_at: now,
        }]);
        state
    }

    #[test]
    fn validate_rejects_task_count_mismatch() {
        let mut j = job("build", JobStatus::Pending);
        j.tasks_total = 3;
        let err = state_with(vec![j]).validate().unwrap_err();
        assert!(err.contains("tasks_total 3 but 2 task entries"), "got: {err}");
    }

    #[test]
    fn validate_rejects_tasks_completed_not_matching_tasks() {
        let mut j = job("build", JobStatus::Pending);
        j.tasks_completed = 1;
        let err = state_with(vec![j.clone()]).validate().unwrap_err();
        assert!(err.contains("tasks_completed 1 but 0 COMPLETED"), "got: {err}");

        j.record_task_progress(1, Utc::now());
        state_with(vec![j]).validate().unwrap();
    }

    #[test]
    fn validate_rejects_two_running_jobs() {
        let mut state = state_with(vec![
            job("a", JobStatus::Running),
            job("b", JobStatus::Running),
        ]);
        state.global.set_current(JobRef::new("core", "b"));
        let err = state.validate().unwrap_err();
        assert!(err.contains("more than one job is RUNNING"), "got: {err}");
    }

    #[test]
    fn validate_rejects_unknown_version() {
        let mut state = ExecutionState::new(Utc::now());
        state.version = "1.0".to_owned();
        assert!(state.validate().is_err());
    }
}
