//! Destination registry: the customer databases a job fans out over

use std::fmt;

use serde::Deserialize;
use sinkline_core::{
    connect_with_retry, ConnectionDescriptor, ConnectionFailure, Connector, Dataset, DbError,
    RetryPolicy, TransformFailure, Value,
};

/// One customer database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub descriptor: ConnectionDescriptor,
    pub kind: i64,
}

impl Destination {
    pub fn new(name: impl Into<String>, descriptor: ConnectionDescriptor, kind: i64) -> Self {
        Self {
            name: name.into(),
            descriptor,
            kind,
        }
    }
}

/// Where and how destinations are read from the registry database
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub query: String,
    pub name_column: String,
    pub descriptor_column: String,
    pub kind_column: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            query: "SELECT Klantnaam, ConnectionString, Type FROM Klanten".to_string(),
            name_column: "Klantnaam".to_string(),
            descriptor_column: "ConnectionString".to_string(),
            kind_column: "Type".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Connection(ConnectionFailure),
    Query(DbError),
    Invalid(TransformFailure),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "registry connection: {e}"),
            Self::Query(e) => write!(f, "registry query: {e}"),
            Self::Invalid(e) => write!(f, "registry contents: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Query(e) => Some(e),
            Self::Invalid(e) => Some(e),
        }
    }
}

/// Read and validate all destinations. Invalid rows are logged and skipped.
pub fn load_destinations(
    connector: &dyn Connector,
    retry: &RetryPolicy,
    config: &RegistryConfig,
) -> Result<Vec<Destination>, RegistryError> {
    let mut conn = connect_with_retry(connector, retry).map_err(RegistryError::Connection)?;
    let rows = conn.query(&config.query, &[]).map_err(RegistryError::Query)?;
    let (destinations, rejected) = parse_destinations(&rows, config).map_err(RegistryError::Invalid)?;
    for e in &rejected {
        log::warn!("skipping registry row: {e}");
    }
    log::info!("{} destination(s) loaded from registry", destinations.len());
    Ok(destinations)
}

/// Validate registry rows by column name.
///
/// Fails only when a configured column is absent; row-level problems are
/// returned alongside the valid destinations.
pub fn parse_destinations(
    rows: &Dataset,
    config: &RegistryConfig,
) -> Result<(Vec<Destination>, Vec<TransformFailure>), TransformFailure> {
    let names = rows.column(&config.name_column)?;
    let descriptors = rows.column(&config.descriptor_column)?;
    let kinds = rows.column(&config.kind_column)?;

    let mut valid = Vec::with_capacity(names.len());
    let mut rejected = Vec::new();
    for (row, ((name, descriptor), kind)) in names.iter().zip(&descriptors).zip(&kinds).enumerate() {
        match destination_from(name, descriptor, kind) {
            Ok(d) => valid.push(d),
            Err(reason) => rejected.push(TransformFailure::InvalidRecord { row, reason }),
        }
    }
    Ok((valid, rejected))
}

fn non_empty_text(v: &Value, field: &str) -> Result<String, String> {
    match v {
        Value::Text(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Null => Err(format!("{field} is missing")),
        other => Err(format!("{field} must be text, got {}", other.kind())),
    }
}

fn destination_from(name: &Value, descriptor: &Value, kind: &Value) -> Result<Destination, String> {
    let name = non_empty_text(name, "name")?;
    let descriptor = non_empty_text(descriptor, "connection string")?;
    let kind = match kind {
        Value::Int(k) => *k,
        Value::Float(k) if k.fract() == 0.0 => *k as i64,
        Value::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| format!("type '{s}' is not a number"))?,
        Value::Null => return Err("type is missing".to_string()),
        other => return Err(format!("type must be a number, got {}", other.kind())),
    };
    Ok(Destination::new(name, ConnectionDescriptor::parse(&descriptor), kind))
}

/// Which destinations a job processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFilter {
    pub kind: i64,
    /// Empty means every customer
    pub customers: Vec<String>,
}

impl Default for DestinationFilter {
    fn default() -> Self {
        Self {
            kind: 1,
            customers: Vec::new(),
        }
    }
}

impl DestinationFilter {
    pub fn admits(&self, destination: &Destination) -> bool {
        destination.kind == self.kind
            && (self.customers.is_empty() || self.customers.iter().any(|c| c == &destination.name))
    }
}
