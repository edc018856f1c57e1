//! Embedded DuckDB backend
//!
//! One database instance is opened per file while any connector for it is
//! alive; connectors hand out clones of it so several connectors (destination,
//! log store, registry) can share a file. The instance is released when the
//! last connector for the file drops. Connections must not outlive their
//! connector, or a later reopen of the file conflicts with them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use duckdb::types::{TimeUnit, ToSqlOutput, Value as DuckValue};
use duckdb::{params_from_iter, ToSql};

use super::{append_in_statements, Connection, Connector, DbError, Dialect};
use crate::dataset::Dataset;
use crate::value::Value;

/// DuckDB has no hard bind limit; keep statements a manageable size
const MAX_PARAMS: usize = 10_000;

struct Instance {
    conn: duckdb::Connection,
    connectors: usize,
}

static INSTANCES: LazyLock<Mutex<HashMap<PathBuf, Instance>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn query_err(e: duckdb::Error) -> DbError {
    DbError::Query(e.to_string())
}

fn connect_err(e: duckdb::Error) -> DbError {
    DbError::Connect(e.to_string())
}

pub struct DuckDbConnector {
    root: duckdb::Connection,
    label: String,
    /// Registry key of a file database
    key: Option<PathBuf>,
}

impl DuckDbConnector {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let mut instances = INSTANCES.lock().unwrap_or_else(PoisonError::into_inner);
        let root = match instances.get_mut(&key) {
            Some(instance) => {
                let clone = instance.conn.try_clone().map_err(connect_err)?;
                instance.connectors += 1;
                clone
            }
            None => {
                let conn = duckdb::Connection::open(&key).map_err(connect_err)?;
                let clone = conn.try_clone().map_err(connect_err)?;
                instances.insert(key.clone(), Instance { conn, connectors: 1 });
                clone
            }
        };
        Ok(Self {
            root,
            label: format!("duckdb({})", key.display()),
            key: Some(key),
        })
    }

    /// Private in-memory database, shared by all connections of this connector
    pub fn open_in_memory() -> Result<Self, DbError> {
        Ok(Self {
            root: duckdb::Connection::open_in_memory().map_err(connect_err)?,
            label: "duckdb(:memory:)".to_string(),
            key: None,
        })
    }
}

impl Drop for DuckDbConnector {
    fn drop(&mut self) {
        let Some(key) = &self.key else {
            return;
        };
        let mut instances = INSTANCES.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = instances.get_mut(key) {
            instance.connectors -= 1;
            if instance.connectors == 0 {
                instances.remove(key);
            }
        }
    }
}

#[cfg(test)]
fn is_open(path: &Path) -> bool {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    INSTANCES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(&key)
}

impl Connector for DuckDbConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let conn = self.root.try_clone().map_err(connect_err)?;
        Ok(Box::new(DuckDbConnection { conn }))
    }

    fn target(&self) -> String {
        self.label.clone()
    }
}

pub struct DuckDbConnection {
    conn: duckdb::Connection,
}

impl Connection for DuckDbConnection {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let n = self
            .conn
            .execute(sql, params_from_iter(params.iter()))
            .map_err(query_err)?;
        Ok(n as u64)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Dataset, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(query_err)?;
        let mut rows = stmt.query(params_from_iter(params.iter())).map_err(query_err)?;
        let columns = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(query_err)? {
            let width = row.as_ref().column_count();
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let v: DuckValue = row.get(i).map_err(query_err)?;
                values.push(from_duck(v)?);
            }
            out.push(values);
        }

        Dataset::from_rows(columns, out).map_err(|e| DbError::Query(e.to_string()))
    }

    fn append(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<u64, DbError> {
        append_in_statements(self, table, columns, rows, MAX_PARAMS)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.conn.execute_batch("BEGIN TRANSACTION").map_err(query_err)
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.conn.execute_batch("COMMIT").map_err(query_err)
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.conn.execute_batch("ROLLBACK").map_err(query_err)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let v = match self {
            Self::Null => DuckValue::Null,
            Self::Bool(b) => DuckValue::Boolean(*b),
            Self::Int(i) => DuckValue::BigInt(*i),
            Self::Float(x) => DuckValue::Double(*x),
            Self::Text(s) => DuckValue::Text(s.clone()),
            // temporal values travel as ISO text and are cast by the column type
            Self::Date(_) | Self::DateTime(_) | Self::Time(_) => DuckValue::Text(self.to_string()),
        };
        Ok(ToSqlOutput::Owned(v))
    }
}

fn to_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v * 1_000_000,
        TimeUnit::Millisecond => v * 1_000,
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

fn from_duck(v: DuckValue) -> Result<Value, DbError> {
    Ok(match v {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i.into()),
        DuckValue::SmallInt(i) => Value::Int(i.into()),
        DuckValue::Int(i) => Value::Int(i.into()),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::UTinyInt(i) => Value::Int(i.into()),
        DuckValue::USmallInt(i) => Value::Int(i.into()),
        DuckValue::UInt(i) => Value::Int(i.into()),
        DuckValue::UBigInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::Float(x) => Value::Float(x.into()),
        DuckValue::Double(x) => Value::Float(x),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| DbError::Unsupported(format!("decimal {d}: {e}")))?,
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Date32(days) => Value::Date(NaiveDate::default() + TimeDelta::days(days.into())),
        DuckValue::Timestamp(unit, v) => {
            let micros = to_micros(unit, v);
            Value::DateTime(NaiveDateTime::default() + TimeDelta::microseconds(micros))
        }
        DuckValue::Time64(unit, v) => {
            Value::Time(NaiveTime::default() + TimeDelta::microseconds(to_micros(unit, v)))
        }
        other => return Err(DbError::Unsupported(format!("{other:?}"))),
    })
}
