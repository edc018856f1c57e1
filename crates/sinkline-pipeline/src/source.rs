//! Sources produce the dataset a job loads into each destination

use std::collections::BTreeMap;

use sinkline_core::{
    connect_with_retry, ConnectionDescriptor, Dataset, ExternalSourceFailure, RetryPolicy, Value,
};

use crate::registry::Destination;

/// Upstream system a job reads from.
pub trait Source {
    /// Label used in logs and failures
    fn name(&self) -> &str;

    /// Obtain credentials for `destination`'s data, if the source needs any
    fn authenticate(&mut self, _destination: &Destination) -> Result<(), ExternalSourceFailure> {
        Ok(())
    }

    fn fetch(&mut self, destination: &Destination) -> Result<Dataset, ExternalSourceFailure>;
}

/// Runs a query against a database; by default the destination's own.
#[derive(Debug, Clone)]
pub struct SqlSource {
    name: String,
    query: String,
    params: Vec<Value>,
    database: Option<ConnectionDescriptor>,
    retry: RetryPolicy,
}

impl SqlSource {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            params: Vec::new(),
            database: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Query this database instead of the destination
    pub fn with_database(mut self, database: ConnectionDescriptor) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Source for SqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&mut self, destination: &Destination) -> Result<Dataset, ExternalSourceFailure> {
        let descriptor = self.database.as_ref().unwrap_or(&destination.descriptor);
        let connector = descriptor
            .connector()
            .map_err(|e| ExternalSourceFailure::new(&self.name, e))?;
        let mut conn = connect_with_retry(connector.as_ref(), &self.retry)
            .map_err(|e| ExternalSourceFailure::new(&self.name, e))?;
        let dataset = conn
            .query(&self.query, &self.params)
            .map_err(|e| ExternalSourceFailure::new(&self.name, e))?;
        log::debug!("{}: fetched {} rows for {}", self.name, dataset.num_rows(), destination.name);
        Ok(dataset)
    }
}

/// Fixed in-memory datasets, optionally one per customer.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    default: Option<Dataset>,
    per_customer: BTreeMap<String, Dataset>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, dataset: Dataset) -> Self {
        Self {
            name: name.into(),
            default: Some(dataset),
            per_customer: BTreeMap::new(),
        }
    }

    /// Source with only per-customer datasets; other customers fail to fetch
    pub fn per_customer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            per_customer: BTreeMap::new(),
        }
    }

    pub fn with_customer(mut self, customer: impl Into<String>, dataset: Dataset) -> Self {
        self.per_customer.insert(customer.into(), dataset);
        self
    }
}

impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&mut self, destination: &Destination) -> Result<Dataset, ExternalSourceFailure> {
        self.per_customer
            .get(&destination.name)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| {
                ExternalSourceFailure::new(&self.name, format!("no data for {}", destination.name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_row(v: i64) -> Dataset {
        Dataset::from_rows(vec!["x".into()], vec![vec![Value::Int(v)]]).unwrap()
    }

    fn dest(name: &str) -> Destination {
        Destination::new(name, ConnectionDescriptor::DuckDb(None), 1)
    }

    #[test]
    fn static_source_prefers_customer_dataset() {
        let mut source = StaticSource::new("static", one_row(1)).with_customer("Acme", one_row(2));
        assert_eq!(source.fetch(&dest("Acme")).unwrap().row(0), vec![Value::Int(2)]);
        assert_eq!(source.fetch(&dest("Globex")).unwrap().row(0), vec![Value::Int(1)]);
    }

    #[test]
    fn per_customer_source_fails_for_unknown() {
        let mut source = StaticSource::per_customer("static").with_customer("Acme", one_row(2));
        let err = source.fetch(&dest("Globex")).unwrap_err();
        assert_eq!(err.origin, "static");
        assert!(err.message.contains("Globex"));
    }

    #[test]
    fn sql_source_queries_configured_database() {
        let mut source = SqlSource::new("uren", "SELECT 41 + ? AS antwoord")
            .with_params(vec![Value::Int(1)])
            .with_database(ConnectionDescriptor::DuckDb(None))
            .with_retry(RetryPolicy::immediate(1));
        let ds = source.fetch(&dest("Acme")).unwrap();
        assert_eq!(ds.column_names(), vec!["antwoord"]);
        assert_eq!(ds.row(0), vec![Value::Int(42)]);
    }

    #[test]
    fn sql_source_wraps_query_errors() {
        let mut source = SqlSource::new("uren", "SELECT * FROM ontbreekt")
            .with_retry(RetryPolicy::immediate(1));
        let err = source.fetch(&dest("Acme")).unwrap_err();
        assert_eq!(err.origin, "uren");
    }
}
