//! `morty stat` command: show progress and per-job status.

use anyhow::Result;

use morty_core::state::queries;
use morty_core::{JobStatus, StateStore};

use crate::config::MortyConfig;

fn status_icon(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => ".",
        JobStatus::Running => "*",
        JobStatus::Completed => "+",
        JobStatus::Failed => "!",
        JobStatus::Blocked => "X",
    }
}

/// Run the status command.
pub fn run_status(config: &MortyConfig, json: bool) -> Result<()> {
    let store = StateStore::new(&config.state_file);
    let Some(state) = store.load_optional()? else {
        println!(
            "No state file at {}. Run `morty plan sync` or `morty doing` first.",
            config.state_file.display()
        );
        return Ok(());
    };

    let progress = queries::progress(&state);
    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    let global = &state.global;
    println!("Status: {}", global.status);
    println!(
        "Started: {}   Updated: {}",
        global.start_time.format("%Y-%m-%d %H:%M:%S UTC"),
        global.last_update.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(current) = &global.current {
        println!("Current: {current}");
    }
    println!(
        "Progress: {}/{} jobs ({:.0}%), {}/{} modules",
        progress.completed,
        progress.total,
        progress.percent_complete(),
        global.completed_modules,
        global.total_modules
    );
    println!(
        "  pending={} running={} completed={} failed={} blocked={}",
        progress.pending, progress.running, progress.completed, progress.failed, progress.blocked,
    );

    for module in state.modules() {
        println!();
        let title = module.display_name.as_deref().unwrap_or(&module.name);
        println!("[{}] {} ({})", status_icon(module.status), title, module.status);
        for job in &module.jobs {
            println!(
                "  [{}] {:>3}. {} ({}/{} tasks, attempt {}, retries {})",
                status_icon(job.status),
                job.index,
                job.name,
                job.tasks_completed,
                job.tasks_total,
                job.loop_count,
                job.retry_count,
            );
            if let Some(reason) = &job.failure_reason {
                if job.status != JobStatus::Completed {
                    println!("        last error: {reason}");
                }
            }
        }
    }

    Ok(())
}
