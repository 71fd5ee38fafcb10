//! Configuration for morty.
//!
//! TOML files at `.morty/settings.toml` (project) and
//! `~/.config/morty/config.toml` (user), resolved with the chain:
//! CLI flag > env var > project file > user file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use morty_core::plan::{DEFAULT_REQUIRED_MODULE, GraphOptions};
use morty_core::scheduler::{DEFAULT_MAX_RETRIES, RetryPolicy};

pub const DEFAULT_PLAN_DIR: &str = ".morty/plan";
pub const DEFAULT_STATE_FILE: &str = ".morty/status.json";
pub const DEFAULT_AGENT_COMMAND: &str = "claude";
pub const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// One config file. Every key is optional so files can be layered.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub paths: PathsSection,
    pub execution: ExecutionSection,
    pub agent: AgentSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub plan_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    /// Module every plan must contain. An empty string disables the check.
    pub required_module: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl ConfigFile {
    /// Overlay `other` on top of `self`: keys set in `other` win.
    pub fn merge(self, other: ConfigFile) -> ConfigFile {
        ConfigFile {
            paths: PathsSection {
                plan_dir: other.paths.plan_dir.or(self.paths.plan_dir),
                state_file: other.paths.state_file.or(self.paths.state_file),
            },
            execution: ExecutionSection {
                max_retries: other.execution.max_retries.or(self.execution.max_retries),
                retry_base_delay_ms: other
                    .execution
                    .retry_base_delay_ms
                    .or(self.execution.retry_base_delay_ms),
                retry_max_delay_ms: other
                    .execution
                    .retry_max_delay_ms
                    .or(self.execution.retry_max_delay_ms),
                required_module: other
                    .execution
                    .required_module
                    .or(self.execution.required_module),
            },
            agent: AgentSection {
                command: other.agent.command.or(self.agent.command),
                args: other.agent.args.or(self.agent.args),
                working_dir: other.agent.working_dir.or(self.agent.working_dir),
            },
            logging: LoggingSection {
                level: other.logging.level.or(self.logging.level),
            },
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the morty user config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/morty` or `~/.config/morty`.
pub fn user_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("morty");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("morty")
}

pub fn user_config_path() -> PathBuf {
    user_config_dir().join("config.toml")
}

pub fn project_config_path(root: &Path) -> PathBuf {
    root.join(".morty").join("settings.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load a config file. A missing file is `Ok(None)`; a malformed one is an
/// error naming the file.
pub fn load_config_file(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config file {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(config))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub plan_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub max_retries: Option<u32>,
    pub agent_command: Option<String>,
    pub log_level: Option<String>,
}

/// Agent process settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use. Relative paths are joined
/// onto the project root.
#[derive(Debug, Clone)]
pub struct MortyConfig {
    pub plan_dir: PathBuf,
    pub state_file: PathBuf,
    pub retry_policy: RetryPolicy,
    pub graph_options: GraphOptions,
    pub agent: AgentConfig,
    pub log_level: String,
}

impl MortyConfig {
    /// Resolve configuration for the project at `root` from the real
    /// environment and config files.
    pub fn resolve(cli: &CliOverrides, root: &Path) -> Result<Self> {
        let user = load_config_file(&user_config_path())?.unwrap_or_default();
        let project = load_config_file(&project_config_path(root))?.unwrap_or_default();
        Self::resolve_with(cli, |key| std::env::var(key).ok(), user.merge(project), root)
    }

    /// Resolve from explicit inputs. `env` looks up an environment variable;
    /// `file` is the already layered config file.
    pub fn resolve_with(
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
        file: ConfigFile,
        root: &Path,
    ) -> Result<Self> {
        let env_u32 = |key: &str| -> Result<Option<u32>> {
            env(key)
                .map(|v| {
                    v.trim()
                        .parse::<u32>()
                        .with_context(|| format!("{key} must be a non-negative integer, got {v:?}"))
                })
                .transpose()
        };

        let plan_dir = cli
            .plan_dir
            .clone()
            .or_else(|| env("MORTY_PLAN_DIR").map(PathBuf::from))
            .or(file.paths.plan_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLAN_DIR));

        let state_file = cli
            .state_file
            .clone()
            .or_else(|| env("MORTY_STATE_FILE").map(PathBuf::from))
            .or(file.paths.state_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));

        let max_retries = match cli.max_retries {
            Some(n) => n,
            None => env_u32("MORTY_MAX_RETRIES")?
                .or(file.execution.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
        };
        let retry_policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(
                file.execution
                    .retry_base_delay_ms
                    .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            ),
            max_delay: Duration::from_millis(
                file.execution
                    .retry_max_delay_ms
                    .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
            ),
        };

        let graph_options = match file.execution.required_module {
            Some(name) if name.is_empty() => GraphOptions::permissive(),
            Some(name) => GraphOptions {
                required_module: Some(name),
            },
            None => GraphOptions {
                required_module: Some(DEFAULT_REQUIRED_MODULE.to_owned()),
            },
        };

        let agent = AgentConfig {
            command: cli
                .agent_command
                .clone()
                .or_else(|| env("MORTY_AGENT_COMMAND"))
                .or(file.agent.command)
                .unwrap_or_else(|| DEFAULT_AGENT_COMMAND.to_owned()),
            args: file.agent.args.unwrap_or_default(),
            working_dir: file.agent.working_dir.map(|d| root.join(d)),
        };

        let log_level = cli
            .log_level
            .clone()
            .or_else(|| env("MORTY_LOG_LEVEL"))
            .or(file.logging.level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());

        Ok(Self {
            plan_dir: root.join(plan_dir),
            state_file: root.join(state_file),
            retry_policy,
            graph_options,
            agent,
            log_level,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn file(toml_text: &str) -> ConfigFile {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let root = Path::new("/proj");
        let config =
            MortyConfig::resolve_with(&CliOverrides::default(), no_env, ConfigFile::default(), root)
                .unwrap();
        assert_eq!(config.plan_dir, root.join(".morty/plan"));
        assert_eq!(config.state_file, root.join(".morty/status.json"));
        assert_eq!(config.retry_policy, RetryPolicy::default());
        assert_eq!(config.graph_options, GraphOptions::default());
        assert_eq!(config.agent.command, "claude");
        assert!(config.agent.args.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn file_values_apply() {
        let cfg = file(
            r#"
            [paths]
            plan_dir = "plans"
            state_file = "state/run.json"

            [execution]
            max_retries = 5
            retry_base_delay_ms = 10
            retry_max_delay_ms = 40
            required_module = ""

            [agent]
            command = "my-agent"
            args = ["--print", "--verbose"]
            working_dir = "src"

            [logging]
            level = "debug"
            "#,
        );
        let root = Path::new("/proj");
        let config = MortyConfig::resolve_with(&CliOverrides::default(), no_env, cfg, root).unwrap();
        assert_eq!(config.plan_dir, root.join("plans"));
        assert_eq!(config.state_file, root.join("state/run.json"));
        assert_eq!(config.retry_policy.max_retries, 5);
        assert_eq!(config.retry_policy.base_delay, Duration::from_millis(10));
        assert_eq!(config.retry_policy.max_delay, Duration::from_millis(40));
        assert_eq!(config.graph_options, GraphOptions::permissive());
        assert_eq!(config.agent.command, "my-agent");
        assert_eq!(config.agent.args, vec!["--print", "--verbose"]);
        assert_eq!(config.agent.working_dir, Some(root.join("src")));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn env_overrides_file_and_cli_overrides_env() {
        let cfg = file("[execution]\nmax_retries = 5\n[agent]\ncommand = \"file-agent\"\n");
        let env = env_of(&[("MORTY_MAX_RETRIES", "7"), ("MORTY_AGENT_COMMAND", "env-agent")]);
        let root = Path::new("/proj");

        let config =
            MortyConfig::resolve_with(&CliOverrides::default(), &env, cfg.clone(), root).unwrap();
        assert_eq!(config.retry_policy.max_retries, 7);
        assert_eq!(config.agent.command, "env-agent");

        let cli = CliOverrides {
            max_retries: Some(1),
            agent_command: Some("cli-agent".to_owned()),
            ..Default::default()
        };
        let config = MortyConfig::resolve_with(&cli, &env, cfg, root).unwrap();
        assert_eq!(config.retry_policy.max_retries, 1);
        assert_eq!(config.agent.command, "cli-agent");
    }

    #[test]
    fn invalid_env_number_is_an_error() {
        let env = env_of(&[("MORTY_MAX_RETRIES", "three")]);
        let err = MortyConfig::resolve_with(
            &CliOverrides::default(),
            env,
            ConfigFile::default(),
            Path::new("/proj"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("MORTY_MAX_RETRIES"), "{err}");
    }

    #[test]
    fn absolute_paths_are_kept() {
        let cli = CliOverrides {
            state_file: Some(PathBuf::from("/tmp/elsewhere.json")),
            ..Default::default()
        };
        let config =
            MortyConfig::resolve_with(&cli, no_env, ConfigFile::default(), Path::new("/proj"))
                .unwrap();
        assert_eq!(config.state_file, PathBuf::from("/tmp/elsewhere.json"));
    }

    #[test]
    fn project_file_overrides_user_file() {
        let user = file("[agent]\ncommand = \"user\"\nargs = [\"-u\"]\n[logging]\nlevel = \"warn\"\n");
        let project = file("[agent]\ncommand = \"project\"\n");
        let merged = user.merge(project);
        assert_eq!(merged.agent.command.as_deref(), Some("project"));
        assert_eq!(merged.agent.args, Some(vec!["-u".to_owned()]));
        assert_eq!(merged.logging.level.as_deref(), Some("warn"));
    }

    #[test]
    fn load_missing_file_is_none_and_bad_file_names_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_config_file(&tmp.path().join("absent.toml")).unwrap().is_none());

        let bad = tmp.path().join("bad.toml");
        std::fs::write(&bad, "[paths\nplan_dir = 1").unwrap();
        let err = load_config_file(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"), "{err:#}");
    }

    #[test]
    fn user_config_path_ends_with_expected_filename() {
        assert!(user_config_path().ends_with("morty/config.toml"));
    }
}
