//! Table resetter: delete the rows a reload is about to replace

use std::fmt;

use chrono::NaiveDate;
use rustc_hash::FxHashSet;

use crate::connect::{connect_with_retry, RetryPolicy};
use crate::dataset::Dataset;
use crate::db::{Connection, Connector, DbError};
use crate::error::{ResetFailure, SinkCause, TransformFailure};
use crate::value::Value;

/// Maximum ids bound in one DELETE statement
pub const KEY_CHUNK_SIZE: usize = 500;

/// Which destination rows to delete before reload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResetScope {
    All,
    Keys { column: String, ids: Vec<Value> },
    /// Inclusive on both ends; on datetime columns the whole `end` day is covered
    DateRange {
        column: String,
        start: NaiveDate,
        end: NaiveDate,
    },
}

impl ResetScope {
    /// Key scope over the values of `column` in `dataset`
    pub fn keys_from(dataset: &Dataset, column: &str) -> Result<Self, TransformFailure> {
        Ok(Self::Keys {
            column: column.to_string(),
            ids: dataset.column(column)?,
        })
    }
}

impl fmt::Display for ResetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all rows"),
            Self::Keys { column, ids } => write!(f, "{} key(s) in {column}", ids.len()),
            Self::DateRange { column, start, end } => {
                write!(f, "{column} between {start} and {end}")
            }
        }
    }
}

/// Drop nulls and repeated ids, keeping first-seen order
fn unique_ids(ids: &[Value]) -> Vec<Value> {
    let mut seen = FxHashSet::default();
    ids.iter()
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(v.dedup_key()))
        .cloned()
        .collect()
}

pub struct TableResetter<'a> {
    connector: &'a dyn Connector,
    retry: RetryPolicy,
}

impl<'a> TableResetter<'a> {
    pub fn new(connector: &'a dyn Connector) -> Self {
        Self {
            connector,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Delete the rows of `table` selected by `scope`, returning the count.
    ///
    /// Every statement commits on its own. A failure part way through a key
    /// list leaves earlier chunks deleted; the failure carries that count.
    pub fn reset(&self, table: &str, scope: &ResetScope) -> Result<u64, ResetFailure> {
        let fail = |rows_deleted: u64, cause: SinkCause| ResetFailure {
            table: table.to_string(),
            rows_deleted,
            cause,
        };

        if let ResetScope::Keys { ids, .. } = scope {
            if ids.iter().all(Value::is_null) {
                log::info!("no keys to clear in table {table}");
                return Ok(0);
            }
        }
        if let ResetScope::DateRange { start, end, .. } = scope {
            if start > end {
                return Err(fail(
                    0,
                    SinkCause::InvalidInput(format!("date range {start}..{end} is reversed")),
                ));
            }
        }

        let mut conn = connect_with_retry(self.connector, &self.retry).map_err(|e| fail(0, e.into()))?;
        let dialect = conn.dialect();
        let quoted = dialect.quote_table(table);

        let deleted = match scope {
            ResetScope::All => {
                let sql = format!("DELETE FROM {quoted}");
                delete_committed(conn.as_mut(), &sql, &[]).map_err(|e| fail(0, e.into()))?
            }
            ResetScope::DateRange { column, start, end } => {
                // half-open on the day after `end` so datetime columns lose the whole end day
                let column = dialect.quote_ident(column);
                let (sql, params) = match end.succ_opt() {
                    Some(next) => (
                        format!(
                            "DELETE FROM {quoted} WHERE {column} >= {} AND {column} < {}",
                            dialect.placeholder(1),
                            dialect.placeholder(2)
                        ),
                        vec![Value::Date(*start), Value::Date(next)],
                    ),
                    None => (
                        format!("DELETE FROM {quoted} WHERE {column} >= {}", dialect.placeholder(1)),
                        vec![Value::Date(*start)],
                    ),
                };
                delete_committed(conn.as_mut(), &sql, &params).map_err(|e| fail(0, e.into()))?
            }
            ResetScope::Keys { column, ids } => {
                let ids = unique_ids(ids);
                let mut deleted = 0u64;
                for chunk in ids.chunks(KEY_CHUNK_SIZE) {
                    let marks = (1..=chunk.len())
                        .map(|i| dialect.placeholder(i))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "DELETE FROM {quoted} WHERE {} IN ({marks})",
                        dialect.quote_ident(column)
                    );
                    let n = delete_committed(conn.as_mut(), &sql, chunk)
                        .map_err(|e| fail(deleted, e.into()))?;
                    deleted += n;
                }
                deleted
            }
        };

        log::debug!("{deleted} rows deleted from table {table} ({scope})");
        Ok(deleted)
    }
}

fn delete_committed(conn: &mut dyn Connection, sql: &str, params: &[Value]) -> Result<u64, DbError> {
    conn.begin()?;
    let n = conn.execute(sql, params)?;
    conn.commit()?;
    Ok(n)
}
