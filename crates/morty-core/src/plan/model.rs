//! Plan graph data: the parser-facing records and the validated graph nodes.

use super::prerequisite::Prerequisite;

/// Module dependency that expands to "every other module".
pub const ALL_MODULES: &str = "__ALL__";

// ---------------------------------------------------------------------------
// Parser records
// ---------------------------------------------------------------------------

/// One module as supplied by a plan parser, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub display_name: Option<String>,
    /// The file this module was read from, if any.
    pub plan_file: Option<String>,
    /// Module names, or [`ALL_MODULES`].
    pub dependencies: Vec<String>,
    pub jobs: Vec<JobRecord>,
}

/// One job as supplied by a plan parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRecord {
    pub name: String,
    /// Raw `job_N` / `module:job_N` strings.
    pub prerequisites: Vec<String>,
    pub tasks: Vec<TaskRecord>,
}

/// One task as supplied by a plan parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRecord {
    pub description: String,
}

impl TaskRecord {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated graph nodes
// ---------------------------------------------------------------------------

/// A validated module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub display_name: Option<String>,
    pub plan_file: Option<String>,
    /// Dependencies as written in the plan (wildcard not expanded).
    pub declared_dependencies: Vec<String>,
    /// Effective dependencies: wildcard expanded, plus every module named by
    /// a cross-module prerequisite. Sorted, no duplicates, never self.
    pub dependencies: Vec<String>,
    /// Jobs in declared order; `jobs[i].number == i + 1`.
    pub jobs: Vec<Job>,
    /// Positions into `jobs`, in execution (topologically sorted) order.
    pub job_order: Vec<usize>,
}

impl Module {
    /// Look up a job by its 1-based declared number.
    pub fn job_by_number(&self, number: usize) -> Option<&Job> {
        number.checked_sub(1).and_then(|i| self.jobs.get(i))
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Jobs in execution order.
    pub fn sorted_jobs(&self) -> impl Iterator<Item = &Job> {
        self.job_order.iter().map(|&i| &self.jobs[i])
    }
}

/// A validated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    /// 1-based position as declared in the plan; what `job_N` refers to.
    pub number: usize,
    pub prerequisites: Vec<Prerequisite>,
    pub tasks: Vec<Task>,
}

/// A task inside a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// 0-based position within the job.
    pub index: usize,
    pub description: String,
}
