//! Run identifier allocation

use crate::connect::{connect_with_retry, RetryPolicy};
use crate::db::{Connector, DbError};
use crate::value::Value;

/// How a process obtains its run identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunIdStrategy {
    /// Next value of a database sequence object; atomic across processes
    Sequence { name: String },
    /// `max(column) + 1` over the log table; two processes starting together
    /// can receive the same id
    MaxPlusOne { table: String, column: String },
}

impl Default for RunIdStrategy {
    fn default() -> Self {
        Self::Sequence {
            name: "Script_ID_seq".to_string(),
        }
    }
}

impl RunIdStrategy {
    /// Allocate the identifier for this process
    pub fn allocate(&self, connector: &dyn Connector, retry: &RetryPolicy) -> Result<i64, DbError> {
        let mut conn = connect_with_retry(connector, retry).map_err(|e| DbError::Connect(e.to_string()))?;
        match self {
            Self::Sequence { name } => conn.next_sequence_value(name),
            Self::MaxPlusOne { table, column } => {
                log::warn!(
                    "run id taken as max({column})+1 from {table}; concurrent runs may share an id"
                );
                let dialect = conn.dialect();
                let sql = format!(
                    "SELECT MAX({}) FROM {}",
                    dialect.quote_ident(column),
                    dialect.quote_table(table)
                );
                let ds = conn.query(&sql, &[])?;
                match ds.rows().first().and_then(|r| r.first()) {
                    None | Some(Value::Null) => Ok(1),
                    Some(Value::Int(max)) => Ok(max + 1),
                    Some(Value::Float(max)) => Ok(*max as i64 + 1),
                    Some(other) => Err(DbError::Query(format!(
                        "max({column}) returned {} value",
                        other.kind()
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::duckdb::DuckDbConnector;

    fn policy() -> RetryPolicy {
        RetryPolicy::immediate(1)
    }

    #[test]
    fn max_plus_one_starts_at_one() {
        let connector = DuckDbConnector::open_in_memory().unwrap();
        connector
            .connect()
            .unwrap()
            .execute("CREATE TABLE Logboek (Script_ID BIGINT)", &[])
            .unwrap();
        let strategy = RunIdStrategy::MaxPlusOne {
            table: "Logboek".into(),
            column: "Script_ID".into(),
        };
        assert_eq!(strategy.allocate(&connector, &policy()).unwrap(), 1);

        connector
            .connect()
            .unwrap()
            .execute("INSERT INTO Logboek VALUES (41)", &[])
            .unwrap();
        assert_eq!(strategy.allocate(&connector, &policy()).unwrap(), 42);
    }

    #[test]
    fn sequence_is_monotonic() {
        let connector = DuckDbConnector::open_in_memory().unwrap();
        connector
            .connect()
            .unwrap()
            .execute("CREATE SEQUENCE Script_ID_seq START 1", &[])
            .unwrap();
        let strategy = RunIdStrategy::default();
        let a = strategy.allocate(&connector, &policy()).unwrap();
        let b = strategy.allocate(&connector, &policy()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn missing_sequence_is_an_error() {
        let connector = DuckDbConnector::open_in_memory().unwrap();
        assert!(RunIdStrategy::default().allocate(&connector, &policy()).is_err());
    }
}
