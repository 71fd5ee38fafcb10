//! Handlers for `morty plan` subcommands.
//!
//! - `morty plan validate`       -- load the plan and print the execution order
//! - `morty plan sync [--force]` -- create or update the state file from the plan

use anyhow::{Context, Result, bail};

use morty_core::plan::{PlanGraph, load_plan_dir};
use morty_core::state::{StateError, StateStore, sync_from_plan};

use crate::PlanCommands;
use crate::config::MortyConfig;

/// Dispatch a `PlanCommands` variant to the appropriate handler.
pub fn run_plan_command(command: PlanCommands, config: &MortyConfig) -> Result<()> {
    match command {
        PlanCommands::Validate => cmd_validate(config),
        PlanCommands::Sync { force } => cmd_sync(config, force),
    }
}

fn load(config: &MortyConfig) -> Result<PlanGraph> {
    load_plan_dir(&config.plan_dir, &config.graph_options)
        .with_context(|| format!("failed to load plan from {}", config.plan_dir.display()))
}

// -----------------------------------------------------------------------
// morty plan validate
// -----------------------------------------------------------------------

fn cmd_validate(config: &MortyConfig) -> Result<()> {
    let graph = load(config)?;

    println!("Plan is valid.");
    println!("  Modules: {}", graph.modules().len());
    println!("  Jobs:    {}", graph.total_jobs());
    println!();
    println!("Execution order:");
    for (i, module) in graph.modules().iter().enumerate() {
        if module.dependencies.is_empty() {
            println!("{:>3}. {}", i + 1, module.name);
        } else {
            println!(
                "{:>3}. {} (after {})",
                i + 1,
                module.name,
                module.dependencies.join(", ")
            );
        }
        for job in module.sorted_jobs() {
            println!("       job_{} {} ({} tasks)", job.number, job.name, job.tasks.len());
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// morty plan sync
// -----------------------------------------------------------------------

fn cmd_sync(config: &MortyConfig, force: bool) -> Result<()> {
    let graph = load(config)?;
    let store = StateStore::new(&config.state_file);

    let existing = match store.load_optional() {
        Ok(existing) => existing,
        Err(err @ StateError::Corrupt { .. }) => {
            if !force {
                bail!("{err}\nRe-run with --force to back it up and start from the plan.");
            }
            let backup = store.backup()?;
            println!("Backed up unreadable state to {}", backup.display());
            None
        }
        Err(err) => return Err(err.into()),
    };

    let created = existing.is_none();
    let state = sync_from_plan(&graph, existing.as_ref());
    store.save(&state)?;

    println!(
        "{} {} ({} modules, {} jobs)",
        if created { "Created" } else { "Synced" },
        store.path().display(),
        state.global.total_modules,
        state.global.total_jobs
    );
    Ok(())
}
