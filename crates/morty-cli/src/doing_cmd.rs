//! `morty doing` command: run the plan through the scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use morty_core::plan::load_plan_dir;
use morty_core::{CommandExecutor, FinalStatus, Scheduler, SchedulerError, StateStore};

use crate::config::MortyConfig;

/// Exit code when work remains but nothing is eligible.
pub const EXIT_NO_ELIGIBLE_JOB: i32 = 2;
/// Exit code when a job exhausted its retries.
pub const EXIT_RETRIES_EXHAUSTED: i32 = 3;
/// Exit code after an interrupt.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Run the doing command.
pub async fn run_doing(config: &MortyConfig, restart: bool) -> Result<()> {
    let graph = load_plan_dir(&config.plan_dir, &config.graph_options)
        .with_context(|| format!("failed to load plan from {}", config.plan_dir.display()))?;

    let mut executor = CommandExecutor::new(&config.agent.command).with_args(&config.agent.args);
    if let Some(dir) = &config.agent.working_dir {
        executor = executor.with_working_dir(dir);
    }
    let store = StateStore::new(&config.state_file);
    let scheduler = Scheduler::new(Arc::new(executor), store, config.retry_policy);

    if restart && scheduler.store().exists() {
        let count = scheduler.reset_all()?;
        println!("Restart: reset {count} job(s) to PENDING.");
    }

    println!(
        "Running plan from {} ({} modules, {} jobs)",
        config.plan_dir.display(),
        graph.modules().len(),
        graph.total_jobs()
    );
    println!("  Agent: {}", config.agent.command);
    println!("  Max retries: {}", config.retry_policy.max_retries);

    // First signal cancels at the next job boundary, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit. The running job stays RUNNING and is requeued next run.");
                std::process::exit(EXIT_INTERRUPTED);
            }
            eprintln!("\nStopping after the current job (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let summary = match scheduler.run(&graph, cancel).await {
        Ok(summary) => summary,
        Err(SchedulerError::RetriesExhausted {
            job,
            retry_count,
            last_error,
        }) => {
            println!("\nJob {job} is BLOCKED after {retry_count} failed attempt(s).");
            println!("  Last error: {last_error}");
            println!(
                "Fix the cause, then `morty reset {:?} {:?}` and run again.",
                job.module, job.job
            );
            std::process::exit(EXIT_RETRIES_EXHAUSTED);
        }
        Err(err) => return Err(err.into()),
    };

    let progress = summary.progress;
    println!(
        "\nJobs completed this run: {}. Overall: {}/{} ({:.0}%).",
        summary.jobs_completed,
        progress.completed,
        progress.total,
        progress.percent_complete()
    );

    match summary.final_status {
        FinalStatus::Completed => {
            println!("Plan completed. All jobs COMPLETED.");
        }
        FinalStatus::NoEligibleJob {
            module,
            waiting,
            stuck,
        } => {
            println!("\nNo eligible job in module {module}.");
            for job in &waiting {
                println!("  waiting: {job}");
            }
            for job in &stuck {
                println!("  stuck:   {job}");
            }
            std::process::exit(EXIT_NO_ELIGIBLE_JOB);
        }
        FinalStatus::Interrupted => {
            println!("Interrupted. Run `morty doing` again to resume.");
            std::process::exit(EXIT_INTERRUPTED);
        }
    }

    Ok(())
}
