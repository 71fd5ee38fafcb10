//! `morty backup` and `morty restore` commands.

use std::path::Path;

use anyhow::Result;

use morty_core::StateStore;

use crate::config::MortyConfig;

pub fn run_backup(config: &MortyConfig, list: bool) -> Result<()> {
    let store = StateStore::new(&config.state_file);
    if list {
        let backups = store.list_backups()?;
        if backups.is_empty() {
            println!("No backups found.");
        }
        for backup in backups {
            println!("{}", backup.display());
        }
        return Ok(());
    }

    let backup = store.backup()?;
    println!("Backed up {} to {}", store.path().display(), backup.display());
    Ok(())
}

pub fn run_restore(config: &MortyConfig, path: &Path) -> Result<()> {
    let store = StateStore::new(&config.state_file);
    let state = store.restore_from_backup(path)?;
    println!(
        "Restored {} from {} ({}/{} jobs completed)",
        store.path().display(),
        path.display(),
        state.global.completed_jobs,
        state.global.total_jobs
    );
    Ok(())
}
