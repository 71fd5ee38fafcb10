//! Plan graph construction and validation.
//!
//! [`build_graph`] turns parser records into a [`PlanGraph`] and rejects:
//! - module names that are empty, contain `:`, or collide with the wildcard,
//! - duplicate module names, or duplicate job names within a module,
//! - malformed prerequisite strings,
//! - prerequisites naming a module or job index that does not exist,
//! - module dependencies naming a module that does not exist,
//! - a missing required module (the end-to-end test module by default),
//! - cycles in the module graph or in any module's job graph.
//!
//! No state is touched; a plan that fails here never reaches the store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use super::model::{ALL_MODULES, Job, Module, ModuleRecord, Task};
use super::prerequisite::{Prerequisite, PrerequisiteParseError};
use crate::topo::{self, CycleError};

/// Name of the module every plan must contain unless configured otherwise.
pub const DEFAULT_REQUIRED_MODULE: &str = "e2e_test";

/// Errors raised while building a [`PlanGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("invalid module name {name:?}: {reason}")]
    InvalidModuleName { name: String, reason: &'static str },

    #[error("duplicate module name: {0:?}")]
    DuplicateModule(String),

    #[error("duplicate job name {job:?} in module {module:?}")]
    DuplicateJob { module: String, job: String },

    #[error("job {job:?} in module {module:?}: {source}")]
    InvalidPrerequisite {
        module: String,
        job: String,
        #[source]
        source: PrerequisiteParseError,
    },

    #[error("job {job:?} in module {module:?} requires {reference}, which does not exist")]
    UnknownPrerequisite {
        module: String,
        job: String,
        reference: Prerequisite,
    },

    #[error("module {module:?} depends on unknown module {dependency:?}")]
    UnknownModuleDependency { module: String, dependency: String },

    #[error("required module {0:?} is missing from the plan")]
    MissingRequiredModule(String),

    #[error("module dependency cycle: {0}")]
    ModuleCycle(#[source] CycleError),

    #[error("job dependency cycle in module {module:?}: {cycle}")]
    JobCycle {
        module: String,
        #[source]
        cycle: CycleError,
    },
}

impl GraphError {
    /// `true` for the cycle variants, `false` for other validation failures.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::ModuleCycle(_) | Self::JobCycle { .. })
    }
}

/// Options for [`build_graph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphOptions {
    /// Module that must be present. `None` disables the check.
    pub required_module: Option<String>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            required_module: Some(DEFAULT_REQUIRED_MODULE.to_owned()),
        }
    }
}

impl GraphOptions {
    /// Options with no required module.
    pub fn permissive() -> Self {
        Self {
            required_module: None,
        }
    }
}

/// A validated, sorted plan.
///
/// Modules are stored in execution order. The graph is never mutated after
/// construction; progress lives in [`crate::state::ExecutionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanGraph {
    modules: Vec<Module>,
    by_name: HashMap<String, usize>,
}

impl PlanGraph {
    /// Modules in execution order.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Look up a module by name.
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.by_name.get(name).map(|&i| &self.modules[i])
    }

    /// Module names in execution order.
    pub fn module_order(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// Total number of jobs across all modules.
    pub fn total_jobs(&self) -> usize {
        self.modules.iter().map(|m| m.jobs.len()).sum()
    }

    /// Resolve a prerequisite held by a job of `owner` to the referenced
    /// module and job.
    pub fn resolve(&self, owner: &str, prerequisite: &Prerequisite) -> Option<(&Module, &Job)> {
        let module = self.module(prerequisite.module(owner))?;
        let job = module.job_by_number(prerequisite.index())?;
        Some((module, job))
    }
}

/// Job number wrapper so cycle reports read `job_N` instead of a bare index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct JobNumber(usize);

impl fmt::Display for JobNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// `:` separates module from job in prerequisites, and the wildcard is
/// reserved for dependency lists.
fn check_module_name(name: &str) -> Result<(), GraphError> {
    let reason = if name.trim().is_empty() {
        "name is empty"
    } else if name.contains(':') {
        "name contains ':'"
    } else if name == ALL_MODULES {
        "name is reserved for the all-modules wildcard"
    } else {
        return Ok(());
    };
    Err(GraphError::InvalidModuleName {
        name: name.to_owned(),
        reason,
    })
}

/// Validate parser records and build the sorted plan graph.
pub fn build_graph(
    records: Vec<ModuleRecord>,
    options: &GraphOptions,
) -> Result<PlanGraph, GraphError> {
    // Well-formed, unique module names.
    let mut seen = HashSet::new();
    for record in &records {
        check_module_name(&record.name)?;
        if !seen.insert(record.name.as_str()) {
            return Err(GraphError::DuplicateModule(record.name.clone()));
        }
    }

    // Unique job names and parsed prerequisites.
    let mut parsed: Vec<Vec<Vec<Prerequisite>>> = Vec::with_capacity(records.len());
    for record in &records {
        let mut job_names = HashSet::new();
        let mut module_prereqs = Vec::with_capacity(record.jobs.len());
        for job in &record.jobs {
            if !job_names.insert(job.name.as_str()) {
                return Err(GraphError::DuplicateJob {
                    module: record.name.clone(),
                    job: job.name.clone(),
                });
            }
            let mut prereqs = Vec::with_capacity(job.prerequisites.len());
            for raw in &job.prerequisites {
                let prereq = raw
                    .parse::<Prerequisite>()
                    .map_err(|source| GraphError::InvalidPrerequisite {
                        module: record.name.clone(),
                        job: job.name.clone(),
                        source,
                    })?
                    .normalize(&record.name);
                if !prereqs.contains(&prereq) {
                    prereqs.push(prereq);
                }
            }
            module_prereqs.push(prereqs);
        }
        parsed.push(module_prereqs);
    }

    // Prerequisites must point at an existing module and job number.
    let job_counts: HashMap<&str, usize> = records
        .iter()
        .map(|r| (r.name.as_str(), r.jobs.len()))
        .collect();
    for (record, module_prereqs) in records.iter().zip(&parsed) {
        for (job, prereqs) in record.jobs.iter().zip(module_prereqs) {
            for prereq in prereqs {
                let target = prereq.module(&record.name);
                let exists = job_counts
                    .get(target)
                    .is_some_and(|&count| prereq.index() <= count);
                if !exists {
                    return Err(GraphError::UnknownPrerequisite {
                        module: record.name.clone(),
                        job: job.name.clone(),
                        reference: prereq.clone(),
                    });
                }
            }
        }
    }

    // Module dependencies must name existing modules.
    for record in &records {
        for dep in &record.dependencies {
            let dep = dep.trim();
            if dep.is_empty() || dep == ALL_MODULES {
                continue;
            }
            if !job_counts.contains_key(dep) {
                return Err(GraphError::UnknownModuleDependency {
                    module: record.name.clone(),
                    dependency: dep.to_owned(),
                });
            }
        }
    }

    if let Some(required) = &options.required_module {
        if !job_counts.contains_key(required.as_str()) {
            return Err(GraphError::MissingRequiredModule(required.clone()));
        }
    }

    // Effective dependencies: wildcard expansion plus modules referenced by
    // cross-module prerequisites.
    let all_names: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
    let mut effective: HashMap<String, Vec<String>> = HashMap::new();
    for (record, module_prereqs) in records.iter().zip(&parsed) {
        let mut deps: BTreeSet<&str> = BTreeSet::new();
        for dep in &record.dependencies {
            let dep = dep.trim();
            if dep == ALL_MODULES {
                deps.extend(all_names.iter().copied());
            } else if !dep.is_empty() {
                deps.insert(dep);
            }
        }
        for prereq in module_prereqs.iter().flatten() {
            if let Prerequisite::CrossModule { module, .. } = prereq {
                deps.insert(module.as_str());
            }
        }
        deps.remove(record.name.as_str());
        effective.insert(
            record.name.clone(),
            deps.into_iter().map(str::to_owned).collect(),
        );
    }

    let names: Vec<String> = all_names.iter().map(|n| (*n).to_owned()).collect();
    let module_order = topo::sort(&names, |name: &String| {
        effective.get(name).cloned().unwrap_or_default()
    })
    .map_err(GraphError::ModuleCycle)?;

    let mut by_record: HashMap<String, (ModuleRecord, Vec<Vec<Prerequisite>>)> = records
        .into_iter()
        .zip(parsed)
        .map(|(r, p)| (r.name.clone(), (r, p)))
        .collect();

    let mut modules = Vec::with_capacity(module_order.len());
    for name in module_order {
        let Some((record, module_prereqs)) = by_record.remove(&name) else {
            continue;
        };
        let jobs: Vec<Job> = record
            .jobs
            .into_iter()
            .zip(module_prereqs)
            .enumerate()
            .map(|(i, (job, prerequisites))| Job {
                name: job.name,
                number: i + 1,
                prerequisites,
                tasks: job
                    .tasks
                    .into_iter()
                    .enumerate()
                    .map(|(index, t)| Task {
                        index,
                        description: t.description,
                    })
                    .collect(),
            })
            .collect();

        let job_order = sort_jobs(&record.name, &jobs)?;
        let dependencies = effective.remove(&record.name).unwrap_or_default();

        modules.push(Module {
            name: record.name,
            display_name: record.display_name,
            plan_file: record.plan_file,
            declared_dependencies: record.dependencies,
            dependencies,
            jobs,
            job_order,
        });
    }

    let by_name = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.clone(), i))
        .collect();

    Ok(PlanGraph { modules, by_name })
}

/// Sort one module's jobs by their same-module prerequisites.
///
/// Cross-module prerequisites are left out: module order already places the
/// referenced module first, and completion is checked at selection time.
fn sort_jobs(module: &str, jobs: &[Job]) -> Result<Vec<usize>, GraphError> {
    let numbers: Vec<JobNumber> = jobs.iter().map(|j| JobNumber(j.number)).collect();
    let order = topo::sort(&numbers, |n: &JobNumber| {
        jobs[n.0 - 1]
            .prerequisites
            .iter()
            .filter_map(|p| match p {
                Prerequisite::SameModule { index } => Some(JobNumber(*index)),
                Prerequisite::CrossModule { .. } => None,
            })
            .collect::<Vec<_>>()
    })
    .map_err(|cycle| GraphError::JobCycle {
        module: module.to_owned(),
        cycle,
    })?;
    Ok(order.into_iter().map(|n| n.0 - 1).collect())
}
