//! End-to-end tests for the `morty` binary.
//!
//! Each test builds a plan directory in a temp project, points the user
//! config at an empty directory, and runs the compiled binary.

use std::path::Path;
use std::process::{Command, Output};

use morty_core::JobStatus;
use morty_test_utils::{PlanBuilder, TestWorkspace, seed_plan};

const FAST_SETTINGS: &str = "\
[execution]
required_module = \"\"
retry_base_delay_ms = 0
retry_max_delay_ms = 0
";

fn project(plan: &PlanBuilder, settings: Option<&str>) -> TestWorkspace {
    let ws = TestWorkspace::new();
    plan.write_dir(&ws.plan_dir()).unwrap();
    if let Some(settings) = settings {
        std::fs::write(ws.path().join(".morty").join("settings.toml"), settings).unwrap();
    }
    ws
}

fn morty(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_morty"))
        .args(args)
        .current_dir(root)
        .env("XDG_CONFIG_HOME", root.join("xdg"))
        .env("RUST_LOG", "warn")
        .env_remove("MORTY_PLAN_DIR")
        .env_remove("MORTY_STATE_FILE")
        .env_remove("MORTY_MAX_RETRIES")
        .env_remove("MORTY_AGENT_COMMAND")
        .env_remove("MORTY_LOG_LEVEL")
        .output()
        .expect("failed to run morty binary")
}

/// Write an agent script that reports every task of its job as done.
#[cfg(unix)]
fn reporting_agent(ws: &TestWorkspace) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = ws.path().join("agent.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\ncat > /dev/null\nprintf '<!-- MORTY_STATUS -->\\n{\"status\": \"COMPLETED\", \"tasks_completed\": %s}\\n<!-- END_MORTY_STATUS -->\\n' \"$MORTY_TASKS_TOTAL\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_owned()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn plan_validate_prints_execution_order() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    let out = morty(ws.path(), &["plan", "validate"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let text = stdout(&out);
    let core = text.find("quicksort_core").unwrap();
    let files = text.find("file_handler").unwrap();
    let cli = text.find(". cli").unwrap();
    assert!(core < files && files < cli, "unexpected order:\n{text}");
}

#[test]
fn plan_validate_requires_e2e_module_by_default() {
    let ws = project(&seed_plan(), None);
    let out = morty(ws.path(), &["plan", "validate"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("e2e_test"), "stderr: {}", stderr(&out));
}

#[test]
fn plan_sync_creates_state_then_stat_reports_it() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    let out = morty(ws.path(), &["plan", "sync"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("Created"));

    let state = ws.store().load().unwrap();
    assert_eq!(state.global.total_jobs, 3);
    assert_eq!(state.global.total_modules, 3);

    let out = morty(ws.path(), &["plan", "sync"]);
    assert!(stdout(&out).contains("Synced"));
    assert_eq!(ws.store().load().unwrap(), state);

    let out = morty(ws.path(), &["stat"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("0/3 jobs"), "{}", stdout(&out));
}

#[test]
fn plan_sync_refuses_corrupt_state_without_force() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    std::fs::write(ws.state_path(), "{ not json").unwrap();

    let out = morty(ws.path(), &["plan", "sync"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("--force"), "stderr: {}", stderr(&out));
    assert_eq!(std::fs::read_to_string(ws.state_path()).unwrap(), "{ not json");

    let out = morty(ws.path(), &["plan", "sync", "--force"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(ws.store().list_backups().unwrap().len(), 1);
    assert!(ws.store().load().is_ok());
}

#[cfg(unix)]
#[test]
fn doing_runs_plan_to_completion() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    let agent = reporting_agent(&ws);
    let out = morty(ws.path(), &["doing", "--agent", &agent]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("Plan completed"));

    let state = ws.store().load().unwrap();
    assert_eq!(state.global.completed_jobs, 3);
    assert_eq!(state.global.status, JobStatus::Completed);
}

#[cfg(unix)]
#[test]
fn doing_does_not_trust_a_silent_zero_exit() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    let out = morty(ws.path(), &["doing", "--agent", "true", "--max-retries", "1"]);
    assert_eq!(out.status.code(), Some(3), "stderr: {}", stderr(&out));

    let state = ws.store().load().unwrap();
    let job = state.modules()[0].jobs[0].clone();
    assert_eq!(job.status, JobStatus::Blocked);
    assert!(
        job.failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("without completion evidence")),
        "{:?}",
        job.failure_reason
    );
}

#[cfg(unix)]
#[test]
fn doing_exits_3_when_retries_are_exhausted() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    let out = morty(ws.path(), &["doing", "--agent", "false", "--max-retries", "2"]);
    assert_eq!(out.status.code(), Some(3), "stderr: {}", stderr(&out));

    let state = ws.store().load().unwrap();
    let job = state.modules()[0].jobs[0].clone();
    assert_eq!(job.status, JobStatus::Blocked);
    assert_eq!(job.retry_count, 2);

    let out = morty(ws.path(), &["stat"]);
    assert!(stdout(&out).contains("[X]"), "{}", stdout(&out));
}

#[cfg(unix)]
#[test]
fn doing_exits_2_when_nothing_is_eligible() {
    let plan = PlanBuilder::new()
        .module("core", &[])
        .job("first", &[], 1)
        .job("second", &["job_1"], 1);
    let ws = project(&plan, Some(FAST_SETTINGS));
    morty(ws.path(), &["plan", "sync"]);

    // Block the first job by hand; the second waits on it forever.
    let mut state = ws.store().load().unwrap();
    state.modules_mut()[0].jobs[0].status = JobStatus::Blocked;
    state.refresh_derived();
    ws.store().save(&state).unwrap();

    let agent = reporting_agent(&ws);
    let out = morty(ws.path(), &["doing", "--agent", &agent]);
    assert_eq!(out.status.code(), Some(2), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("waiting: core/second"), "{}", stdout(&out));
}

#[cfg(unix)]
#[test]
fn reset_all_and_restart_put_jobs_back_to_pending() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    let agent = reporting_agent(&ws);
    morty(ws.path(), &["doing", "--agent", &agent]);

    let out = morty(ws.path(), &["reset", "--all"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let state = ws.store().load().unwrap();
    assert_eq!(state.global.completed_jobs, 0);
    assert!(state.jobs().all(|(_, j)| j.status == JobStatus::Pending && j.loop_count == 0));

    let out = morty(ws.path(), &["doing", "--agent", &agent, "--restart"]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("Jobs completed this run: 3"));
}

#[test]
fn reset_single_job_and_unknown_module() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    morty(ws.path(), &["plan", "sync"]);

    let out = morty(ws.path(), &["reset", "cli", "wire up cli"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let out = morty(ws.path(), &["reset", "nope"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn backup_then_restore() {
    let ws = project(&seed_plan(), Some(FAST_SETTINGS));
    morty(ws.path(), &["plan", "sync"]);
    let original = ws.store().load().unwrap();

    let out = morty(ws.path(), &["backup"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let backups = ws.store().list_backups().unwrap();
    assert_eq!(backups.len(), 1);

    let mut changed = original.clone();
    changed.modules_mut()[0].jobs[0].status = JobStatus::Completed;
    changed.refresh_derived();
    ws.store().save(&changed).unwrap();

    let backup = backups[0].to_str().unwrap();
    let out = morty(ws.path(), &["restore", backup]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(ws.store().load().unwrap(), original);
}

#[test]
fn completions_do_not_need_a_project() {
    let tmp = tempfile::tempdir().unwrap();
    let out = morty(tmp.path(), &["completions", "bash"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("morty"));
}
