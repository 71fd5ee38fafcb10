//! `morty reset` command: put jobs back to PENDING.

use std::sync::Arc;

use anyhow::{Result, bail};

use morty_core::{CommandExecutor, Scheduler, StateStore};

use crate::config::MortyConfig;

/// Run the reset command.
pub fn run_reset(
    config: &MortyConfig,
    module: Option<&str>,
    job: Option<&str>,
    all: bool,
) -> Result<()> {
    // Reset never runs the executor; it only needs the store and the machine.
    let scheduler = Scheduler::new(
        Arc::new(CommandExecutor::new(&config.agent.command)),
        StateStore::new(&config.state_file),
        config.retry_policy,
    );

    match (all, module, job) {
        (true, _, _) => {
            let count = scheduler.reset_all()?;
            println!("Reset {count} job(s) to PENDING.");
        }
        (false, Some(module), Some(job)) => {
            scheduler.reset(module, job)?;
            println!("Reset {module}/{job} to PENDING.");
        }
        (false, Some(module), None) => {
            let count = scheduler.reset_module(module)?;
            println!("Reset {count} job(s) in module {module} to PENDING.");
        }
        (false, None, _) => bail!("nothing to reset: name a module or pass --all"),
    }
    Ok(())
}
