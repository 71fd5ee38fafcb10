mod backup_cmd;
mod config;
mod doing_cmd;
mod plan_cmds;
mod reset_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use config::{CliOverrides, MortyConfig};

#[derive(Parser)]
#[command(name = "morty", version, about = "Plan-driven job runner for coding agents")]
struct Cli {
    /// Plan directory (overrides MORTY_PLAN_DIR and config files)
    #[arg(long, global = true)]
    plan_dir: Option<PathBuf>,

    /// State file (overrides MORTY_STATE_FILE and config files)
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Log level or filter directive (overrides MORTY_LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run jobs from the plan until done, stuck, or interrupted
    Doing {
        /// Reset every job to PENDING before running
        #[arg(long)]
        restart: bool,
        /// Maximum failures per job before it is BLOCKED
        #[arg(long)]
        max_retries: Option<u32>,
        /// Agent command to run for each job
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show progress from the state file
    Stat {
        /// Print the progress summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reset a job, a module, or everything back to PENDING
    Reset {
        /// Module to reset
        #[arg(required_unless_present = "all")]
        module: Option<String>,
        /// Job within the module (omit to reset the whole module)
        job: Option<String>,
        /// Reset every job
        #[arg(long, conflicts_with_all = ["module", "job"])]
        all: bool,
    },
    /// Plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Copy the state file to a timestamped backup
    Backup {
        /// List existing backups instead of creating one
        #[arg(long)]
        list: bool,
    },
    /// Replace the state file with a backup
    Restore {
        /// Backup file to restore
        path: PathBuf,
    },
    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Load the plan and print the execution order
    Validate,
    /// Create or update the state file from the plan
    Sync {
        /// Back up and replace a state file that fails to load
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "morty", &mut std::io::stdout());
        return Ok(());
    }

    let mut overrides = CliOverrides {
        plan_dir: cli.plan_dir,
        state_file: cli.state_file,
        log_level: cli.log_level,
        ..Default::default()
    };
    if let Commands::Doing {
        max_retries, agent, ..
    } = &cli.command
    {
        overrides.max_retries = *max_retries;
        overrides.agent_command = agent.clone();
    }

    let root = std::env::current_dir().context("failed to get current directory")?;
    let config = MortyConfig::resolve(&overrides, &root)?;
    init_tracing(&config.log_level);
    tracing::debug!(?config, "resolved configuration");

    match cli.command {
        Commands::Doing { restart, .. } => {
            doing_cmd::run_doing(&config, restart).await?;
        }
        Commands::Stat { json } => {
            status_cmd::run_status(&config, json)?;
        }
        Commands::Reset { module, job, all } => {
            reset_cmd::run_reset(&config, module.as_deref(), job.as_deref(), all)?;
        }
        Commands::Plan { command } => {
            plan_cmds::run_plan_command(command, &config)?;
        }
        Commands::Backup { list } => {
            backup_cmd::run_backup(&config, list)?;
        }
        Commands::Restore { path } => {
            backup_cmd::run_restore(&config, &path)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
