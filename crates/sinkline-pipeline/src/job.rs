//! Job definitions loaded from TOML

use indexmap::IndexMap;
use serde::Deserialize;
use sinkline_core::writer::DEFAULT_BATCH_SIZE;
use sinkline_core::{ColumnMapping, ConnectionDescriptor, RetryPolicy, TransformFailure, TypeMapping};

use crate::registry::{Destination, DestinationFilter};
use crate::source::{Source, SqlSource};
use crate::window::DateWindow;

/// One `[[jobs]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Script name stamped on audit entries; defaults to `name`
    #[serde(default)]
    pub script: Option<String>,
    /// Source label stamped on audit entries; defaults to the source name
    #[serde(default)]
    pub source_label: Option<String>,
    pub table: String,
    pub source: SourceSpec,
    /// Source column -> destination column, in declaration order
    #[serde(default)]
    pub columns: IndexMap<String, String>,
    /// Destination column -> SQL type name, applied in declaration order
    #[serde(default)]
    pub types: IndexMap<String, String>,
    #[serde(default)]
    pub reset: ResetSpec,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Only these customers; empty means all
    #[serde(default)]
    pub customers: Vec<String>,
    /// Registry type a destination must have
    #[serde(default = "default_kind")]
    pub kind: i64,
    /// Column filled with the customer name before writing
    #[serde(default)]
    pub customer_column: Option<String>,
    /// Destinations declared here instead of in the registry
    #[serde(default)]
    pub destinations: Vec<StaticDestination>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_kind() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Sql {
        query: String,
        /// Queried database; the destination itself when absent
        #[serde(default, deserialize_with = "deserialize_env_var")]
        database: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ResetSpec {
    #[default]
    All,
    /// Delete rows whose `column` value occurs in the fetched dataset
    Keys { column: String },
    DateRange { column: String, window: DateWindow },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticDestination {
    pub name: String,
    #[serde(deserialize_with = "deserialize_required_env_var")]
    pub connection: String,
    #[serde(default = "default_kind")]
    pub kind: i64,
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
pub fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

fn deserialize_required_env_var<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    expand_env_var(&s).ok_or_else(|| serde::de::Error::custom(format!("environment variable in {s} is not set")))
}

/// Expand ${VAR} to environment variable value
pub fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

/// Validated job, ready to run
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub script: String,
    pub source_label: String,
    pub table: String,
    pub columns: ColumnMapping,
    pub types: TypeMapping,
    pub reset: ResetSpec,
    pub batch_size: usize,
    pub filter: DestinationFilter,
    pub customer_column: Option<String>,
    pub destinations: Vec<Destination>,
    source: SourceSpec,
}

impl Job {
    pub fn from_config(config: JobConfig) -> Result<Self, TransformFailure> {
        let types = TypeMapping::parse(config.types.iter().map(|(c, t)| (c.as_str(), t.as_str())))?;
        let source_name = match &config.source {
            SourceSpec::Sql { .. } => "sql",
        };
        Ok(Self {
            script: config.script.unwrap_or_else(|| config.name.clone()),
            source_label: config.source_label.unwrap_or_else(|| source_name.to_string()),
            columns: ColumnMapping::new(config.columns),
            types,
            reset: config.reset,
            batch_size: config.batch_size,
            filter: DestinationFilter {
                kind: config.kind,
                customers: config.customers,
            },
            customer_column: config.customer_column,
            destinations: config
                .destinations
                .into_iter()
                .map(|d| Destination::new(d.name, ConnectionDescriptor::parse(&d.connection), d.kind))
                .collect(),
            source: config.source,
            table: config.table,
            name: config.name,
        })
    }

    /// Instantiate the configured source
    pub fn build_source(&self, retry: RetryPolicy) -> Box<dyn Source> {
        match &self.source {
            SourceSpec::Sql { query, database } => {
                let mut source = SqlSource::new(self.source_label.clone(), query.clone()).with_retry(retry);
                if let Some(db) = database {
                    source = source.with_database(ConnectionDescriptor::parse(db));
                }
                Box::new(source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"
name = "kostenplaatsen"
source_label = "Exact"
table = "Kostenplaatsen"
customer_column = "Klant"
customers = ["Acme"]

[source]
type = "sql"
query = "SELECT Code, Omschrijving FROM staging_kostenplaatsen"

[columns]
Code = "Kostenplaats"

[types]
Kostenplaats = "nvarchar"

[reset]
scope = "date_range"
column = "Datum"
window = "previous_month_to_today"
"#;

    #[test]
    fn parse_job_toml() {
        let config: JobConfig = toml::from_str(JOB).unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.kind, 1);
        assert_eq!(
            config.reset,
            ResetSpec::DateRange {
                column: "Datum".into(),
                window: DateWindow::PreviousMonthToToday
            }
        );

        let job = Job::from_config(config).unwrap();
        assert_eq!(job.script, "kostenplaatsen");
        assert_eq!(job.source_label, "Exact");
        assert_eq!(job.filter.customers, vec!["Acme"]);
        assert_eq!(job.build_source(RetryPolicy::immediate(1)).name(), "Exact");
    }

    #[test]
    fn reset_defaults_to_all() {
        let config: JobConfig = toml::from_str(
            r#"
name = "x"
table = "T"
source = { type = "sql", query = "SELECT 1" }
"#,
        )
        .unwrap();
        assert_eq!(config.reset, ResetSpec::All);
        assert!(config.destinations.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut config: JobConfig = toml::from_str(JOB).unwrap();
        config.types.insert("Bedrag".into(), "money".into());
        let err = Job::from_config(config).unwrap_err();
        assert!(matches!(err, TransformFailure::UnknownType { .. }));
    }

    #[test]
    fn types_apply_in_declaration_order() {
        let config: JobConfig = toml::from_str(
            r#"
name = "x"
table = "T"
source = { type = "sql", query = "SELECT 1" }

[columns]
Zeta = "Z"
Alpha = "A"

[types]
Zeta = "int"
Alpha = "int"
"#,
        )
        .unwrap();
        let renames: Vec<_> = config.columns.values().map(String::as_str).collect();
        assert_eq!(renames, ["Z", "A"]);

        let job = Job::from_config(config).unwrap();
        let ds = sinkline_core::Dataset::empty(&["Other"]);
        let err = job.types.apply(&ds).unwrap_err();
        assert_eq!(err, TransformFailure::MissingColumn { column: "Zeta".into() });
    }

    #[test]
    fn keys_scope_parses() {
        let spec: ResetSpec = toml::from_str(r#"scope = "keys"
column = "Id""#)
            .unwrap();
        assert_eq!(spec, ResetSpec::Keys { column: "Id".into() });
    }

    #[test]
    fn expand_env_var_simple() {
        std::env::set_var("SINKLINE_TEST_DB", "duckdb::memory:");
        assert_eq!(
            expand_env_var("${SINKLINE_TEST_DB}"),
            Some("duckdb::memory:".to_string())
        );
        std::env::remove_var("SINKLINE_TEST_DB");
    }

    #[test]
    fn expand_env_var_missing() {
        assert_eq!(expand_env_var("${NONEXISTENT_VAR_12345}"), None);
    }

    #[test]
    fn static_destinations_parse_descriptors() {
        let config: JobConfig = toml::from_str(
            r#"
name = "x"
table = "T"
source = { type = "sql", query = "SELECT 1" }

[[destinations]]
name = "Lokaal"
connection = "duckdb::memory:"
"#,
        )
        .unwrap();
        let job = Job::from_config(config).unwrap();
        assert_eq!(job.destinations[0].descriptor, ConnectionDescriptor::DuckDb(None));
        assert_eq!(job.destinations[0].kind, 1);
    }
}
