//! Configuration loading from the environment and TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sinkline_core::audit::DEFAULT_LOG_TABLE;
use sinkline_core::{AuditConfig, ConnectionDescriptor, RetryPolicy, RunIdStrategy};
use sinkline_pipeline::job::deserialize_env_var;
use sinkline_pipeline::{Job, JobConfig, RegistryConfig};

pub const CONFIG_FILE: &str = "sinkline.toml";

/// Process environment as seen at startup
#[derive(Debug, Clone)]
pub struct Environment {
    pub base_dir: PathBuf,
    /// A `.env` file was found in the base directory
    pub local: bool,
}

impl Environment {
    /// Resolve the base directory and load its `.env` when present
    pub fn load() -> Self {
        let base_dir = std::env::var_os("SINKLINE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::load_from(base_dir)
    }

    pub fn load_from(base_dir: PathBuf) -> Self {
        let dotenv = base_dir.join(".env");
        let local = match dotenvy::from_path(&dotenv) {
            Ok(()) => true,
            Err(e) if e.not_found() => false,
            Err(e) => {
                log::warn!("ignoring {}: {e}", dotenv.display());
                false
            }
        };
        Self { base_dir, local }
    }

    pub fn label(&self) -> &'static str {
        if self.local {
            "local run"
        } else {
            "production run"
        }
    }
}

/// Global configuration for sinkline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub audit: AuditSection,
    pub run_id: RunIdConfig,
    pub registry: RegistryConfig,
    pub jobs: Vec<JobConfig>,
}

/// Log and registry database
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full descriptor; overrides the SINKLINE_* variables
    #[serde(deserialize_with = "deserialize_env_var")]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_secs: policy.delay.as_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.delay_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub table: String,
    pub buffer_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        let defaults = AuditConfig::default();
        Self {
            table: DEFAULT_LOG_TABLE.to_string(),
            buffer_size: defaults.buffer_size,
            flush_interval_secs: defaults.flush_interval.as_secs(),
        }
    }
}

impl AuditSection {
    pub fn settings(&self) -> AuditConfig {
        AuditConfig {
            buffer_size: self.buffer_size.max(1),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RunIdConfig {
    Sequence {
        #[serde(default = "default_sequence")]
        name: String,
    },
    /// max+1 over the audit table
    MaxPlusOne {
        #[serde(default = "default_run_id_column")]
        column: String,
    },
}

fn default_sequence() -> String {
    "Script_ID_seq".to_string()
}

fn default_run_id_column() -> String {
    "Script_ID".to_string()
}

impl Default for RunIdConfig {
    fn default() -> Self {
        Self::Sequence {
            name: default_sequence(),
        }
    }
}

impl RunIdConfig {
    pub fn strategy(&self, log_table: &str) -> RunIdStrategy {
        match self {
            Self::Sequence { name } => RunIdStrategy::Sequence { name: name.clone() },
            Self::MaxPlusOne { column } => RunIdStrategy::MaxPlusOne {
                table: log_table.to_string(),
                column: column.clone(),
            },
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

impl Config {
    /// Load configuration
    ///
    /// Search order:
    /// 1. `explicit` (the --config argument)
    /// 2. <base_dir>/sinkline.toml
    /// 3. ./sinkline.toml (current directory)
    /// 4. ~/.config/sinkline/sinkline.toml
    pub fn load(explicit: Option<&Path>, base_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let mut candidates = vec![base_dir.join(CONFIG_FILE), PathBuf::from(CONFIG_FILE)];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "sinkline") {
            candidates.push(dirs.config_dir().join(CONFIG_FILE));
        }
        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::from_file(path),
            None => bail!(
                "no {CONFIG_FILE} found (looked in {})",
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Descriptor of the log and registry database
    pub fn log_database(&self) -> Result<ConnectionDescriptor> {
        if let Some(conn) = &self.database.connection {
            return Ok(ConnectionDescriptor::parse(conn));
        }
        Ok(ConnectionDescriptor::sql_server(
            &required_var("SINKLINE_SERVER")?,
            &required_var("SINKLINE_DATABASE")?,
            &required_var("SINKLINE_USERNAME")?,
            &required_var("SINKLINE_PASSWORD")?,
        ))
    }

    /// Validate the jobs named in `names`, or all of them when empty, in config order
    pub fn select_jobs(&self, names: &[String]) -> Result<Vec<Job>> {
        if let Some(unknown) = names.iter().find(|n| !self.jobs.iter().any(|j| &j.name == *n)) {
            bail!("unknown job '{unknown}'");
        }
        self.jobs
            .iter()
            .filter(|j| names.is_empty() || names.contains(&j.name))
            .map(|j| {
                Job::from_config(j.clone()).with_context(|| format!("invalid job '{}'", j.name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[database]
connection = "duckdb::memory:"

[retry]
max_attempts = 5
delay_secs = 1

[audit]
table = "Log"
flush_interval_secs = 10

[run_id]
strategy = "max_plus_one"

[[jobs]]
name = "uren"
table = "Uren"
source = { type = "sql", query = "SELECT * FROM staging_uren" }

[[jobs]]
name = "kosten"
table = "Kosten"
source = { type = "sql", query = "SELECT * FROM staging_kosten" }
types = { Bedrag = "decimal" }
"#;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.audit.table, "Logboek");
        assert_eq!(config.audit.settings(), AuditConfig::default());
        assert_eq!(
            config.run_id.strategy("Logboek"),
            RunIdStrategy::Sequence {
                name: "Script_ID_seq".into()
            }
        );
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn parse_config_toml() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        assert_eq!(config.retry.policy(), RetryPolicy::new(5, Duration::from_secs(1)));
        assert_eq!(config.audit.buffer_size, 100);
        assert_eq!(
            config.run_id.strategy(&config.audit.table),
            RunIdStrategy::MaxPlusOne {
                table: "Log".into(),
                column: "Script_ID".into()
            }
        );
        assert_eq!(config.log_database().unwrap(), ConnectionDescriptor::DuckDb(None));
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn select_jobs_keeps_config_order() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let all = config.select_jobs(&[]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "uren");

        let one = config.select_jobs(&["kosten".to_string()]).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].table, "Kosten");

        let err = config.select_jobs(&["salaris".to_string()]).unwrap_err();
        assert!(err.to_string().contains("salaris"));
    }

    #[test]
    fn explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("other.toml");
        std::fs::write(&explicit, "[retry]\nmax_attempts = 1\n").unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[retry]\nmax_attempts = 2\n").unwrap();

        let config = Config::load(Some(&explicit), dir.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 1);
        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[retry\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn dotenv_marks_local_run() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::load_from(dir.path().to_path_buf());
        assert_eq!(env.label(), "production run");

        std::fs::write(dir.path().join(".env"), "SINKLINE_TEST_DOTENV=ja\n").unwrap();
        let env = Environment::load_from(dir.path().to_path_buf());
        assert_eq!(env.label(), "local run");
        assert_eq!(std::env::var("SINKLINE_TEST_DOTENV").unwrap(), "ja");
    }
}
