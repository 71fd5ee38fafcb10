//! Reconciling a plan graph with persisted state.
//!
//! The plan is authoritative for structure (which modules, jobs and tasks
//! exist, and their order); the state is authoritative for progress. Jobs are
//! matched by (module name, job name) and tasks by index.

use chrono::{DateTime, Utc};

use super::{
    ExecutionState, JobState, JobStatus, ModuleState, STATE_VERSION, TaskState, TaskStatus,
    derive_module_status,
};
use crate::plan::{Job, Module, PlanGraph};

/// Build the state for `graph`, carrying over progress from `existing`.
///
/// New modules and jobs start `PENDING`; modules and jobs no longer in the
/// plan are dropped. Entries are ordered by the graph's execution order.
/// Timestamps only move for entries that actually changed, so syncing an
/// unchanged plan returns a state equal to `existing`.
pub fn sync_from_plan(graph: &PlanGraph, existing: Option<&ExecutionState>) -> ExecutionState {
    let now = Utc::now();
    let base = existing
        .cloned()
        .unwrap_or_else(|| ExecutionState::new(now));

    let mut added = 0usize;
    let mut global_index = 0usize;
    let mut modules = Vec::with_capacity(graph.modules().len());
    for module in graph.modules() {
        let old = base.module(&module.name);
        let jobs: Vec<JobState> = module
            .sorted_jobs()
            .map(|job| {
                global_index += 1;
                let old_job = old.and_then(|m| m.job(&job.name));
                if old_job.is_none() {
                    added += 1;
                }
                sync_job(job, old_job, global_index, now)
            })
            .collect();
        modules.push(sync_module(module, old, jobs, now));
    }

    let removed = base.jobs().count() + added - graph.total_jobs();

    let mut state = base.clone();
    state.version = STATE_VERSION.to_owned();
    state.set_modules(modules);

    if let Some(current) = state.global.current.clone() {
        let still_running = state
            .job(&current)
            .is_some_and(|j| j.status == JobStatus::Running);
        if !still_running {
            tracing::warn!(job = %current, "current job no longer in plan, clearing pointer");
            state.global.clear_current();
        }
    }

    state.refresh_derived();
    if state != base {
        state.global.last_update = now;
        tracing::info!(added, removed, jobs = graph.total_jobs(), "synced state with plan");
    }
    state
}

fn sync_module(
    module: &Module,
    old: Option<&ModuleState>,
    jobs: Vec<JobState>,
    now: DateTime<Utc>,
) -> ModuleState {
    let mut synced = match old {
        Some(old) => old.clone(),
        None => ModuleState {
            name: module.name.clone(),
            display_name: None,
            plan_file: None,
            status: JobStatus::Pending,
            dependencies: Vec::new(),
            jobs: Vec::new(),
            created_at: now,
            updated_at: now,
        },
    };
    synced.display_name = module.display_name.clone();
    synced.plan_file = module.plan_file.clone();
    synced.dependencies = module.dependencies.clone();
    synced.status = derive_module_status(&jobs);
    synced.jobs = jobs;

    if old.is_some_and(|old| *old != synced) {
        synced.updated_at = now;
    }
    synced
}

fn sync_job(job: &Job, old: Option<&JobState>, global_index: usize, now: DateTime<Utc>) -> JobState {
    let tasks: Vec<TaskState> = job
        .tasks
        .iter()
        .map(|task| {
            let prior = old.and_then(|o| o.tasks.get(task.index));
            TaskState {
                index: task.index,
                description: task.description.clone(),
                status: prior.map_or(TaskStatus::Pending, |t| t.status),
                completed_at: prior.and_then(|t| t.completed_at),
            }
        })
        .collect();
    let prerequisites = job.prerequisites.iter().map(ToString::to_string).collect();

    let Some(old) = old else {
        return JobState {
            index: job.number,
            global_index,
            name: job.name.clone(),
            status: JobStatus::Pending,
            prerequisites,
            tasks_total: tasks.len(),
            tasks_completed: 0,
            loop_count: 0,
            retry_count: 0,
            failure_reason: None,
            blocked_by: None,
            tasks,
            created_at: now,
            updated_at: now,
        };
    };

    let mut synced = old.clone();
    synced.index = job.number;
    synced.global_index = global_index;
    synced.prerequisites = prerequisites;
    synced.tasks_total = tasks.len();
    synced.tasks = tasks;
    synced.tasks_completed = synced.count_completed_tasks();
    if synced != *old {
        synced.updated_at = now;
    }
    synced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{GraphOptions, JobRecord, ModuleRecord, TaskRecord, build_graph};
    use crate::state::{JobRef, store};

    fn graph(modules: &[(&str, &[&str], &[&str])]) -> PlanGraph {
        let records = modules
            .iter()
            .map(|(name, deps, jobs)| ModuleRecord {
                name: (*name).to_owned(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                jobs: jobs
                    .iter()
                    .map(|j| JobRecord {
                        name: (*j).to_owned(),
                        prerequisites: vec![],
                        tasks: vec![TaskRecord::new("one"), TaskRecord::new("two")],
                    })
                    .collect(),
                ..Default::default()
            })
            .collect();
        build_graph(records, &GraphOptions::permissive()).unwrap()
    }

    #[test]
    fn fresh_sync_creates_pending_jobs_in_order() {
        let g = graph(&[("b", &["a"], &["b1"]), ("a", &[], &["a1", "a2"])]);
        let state = sync_from_plan(&g, None);
        let order: Vec<(&str, &str, usize)> = state
            .jobs()
            .map(|(m, j)| (m.name.as_str(), j.name.as_str(), j.global_index))
            .collect();
        assert_eq!(order, vec![("a", "a1", 1), ("a", "a2", 2), ("b", "b1", 3)]);
        assert!(state.jobs().all(|(_, j)| j.status == JobStatus::Pending));
        assert_eq!(state.global.total_jobs, 3);
        assert_eq!(state.global.total_modules, 2);
    }

    #[test]
    fn second_sync_is_byte_identical() {
        let g = graph(&[("a", &[], &["a1"]), ("b", &["a"], &["b1"])]);
        let first = sync_from_plan(&g, None);
        let second = sync_from_plan(&g, Some(&first));
        assert_eq!(
            store::to_bytes(&first).unwrap(),
            store::to_bytes(&second).unwrap()
        );
    }

    #[test]
    fn preserves_progress_and_adds_new_jobs() {
        let g1 = graph(&[("a", &[], &["a1"])]);
        let mut state = sync_from_plan(&g1, None);
        let a1 = JobRef::new("a", "a1");
        {
            let job = state.job_mut(&a1).unwrap();
            job.status = JobStatus::Completed;
            job.record_task_progress(2, Utc::now());
            job.loop_count = 1;
        }
        state.refresh_derived();

        let g2 = graph(&[("a", &[], &["a1", "a2"]), ("c", &["a"], &["c1"])]);
        let synced = sync_from_plan(&g2, Some(&state));
        let kept = synced.job(&a1).unwrap();
        assert_eq!(kept.status, JobStatus::Completed);
        assert_eq!(kept.tasks_completed, 2);
        assert_eq!(kept.loop_count, 1);
        assert_eq!(synced.query("a", "a2"), Some(JobStatus::Pending));
        assert_eq!(synced.query("c", "c1"), Some(JobStatus::Pending));
        assert_eq!(synced.global.completed_jobs, 1);
    }

    #[test]
    fn drops_removed_jobs_and_dangling_current_pointer() {
        let g1 = graph(&[("a", &[], &["a1", "a2"])]);
        let mut state = sync_from_plan(&g1, None);
        let a2 = JobRef::new("a", "a2");
        state.job_mut(&a2).unwrap().status = JobStatus::Running;
        state.global.set_current(a2.clone());

        let g2 = graph(&[("a", &[], &["a1"])]);
        let synced = sync_from_plan(&g2, Some(&state));
        assert!(synced.job(&a2).is_none());
        assert_eq!(synced.global.current, None);
        synced.validate().unwrap();
    }
}
