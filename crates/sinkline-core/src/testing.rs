//! Test doubles for connections and log stores
//!
//! Enabled with the `test-utils` feature. Every clone of a [`Recording`] or
//! [`MemoryLogStore`] shares the same state, so a test keeps one handle while
//! the code under test owns another.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::audit::{LogEntry, LogStore};
use crate::dataset::Dataset;
use crate::db::{Connection, Connector, DbError, Dialect};
use crate::value::Value;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A statement passed to `execute` or `query`
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// One `append` call
#[derive(Debug, Clone, PartialEq)]
pub struct AppendCall {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct RecordingState {
    connect_attempts: u32,
    statements: Vec<Statement>,
    appends: Vec<AppendCall>,
    append_calls: usize,
    commits: usize,
    rollbacks: usize,
}

/// Shared log of everything the recording connections saw
#[derive(Debug, Clone, Default)]
pub struct Recording {
    state: Arc<Mutex<RecordingState>>,
}

impl Recording {
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    pub fn statements(&self) -> Vec<Statement> {
        lock(&self.state).statements.clone()
    }

    /// Successful appends, in call order
    pub fn appends(&self) -> Vec<AppendCall> {
        lock(&self.state).appends.clone()
    }

    pub fn append_sizes(&self) -> Vec<usize> {
        lock(&self.state).appends.iter().map(|a| a.rows.len()).collect()
    }

    pub fn commits(&self) -> usize {
        lock(&self.state).commits
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.state).rollbacks
    }
}

/// Connector whose connections record calls instead of talking to a database.
///
/// `execute` reports one affected row per parameter of an `IN (...)` list
/// and zero otherwise.
#[derive(Debug, Clone)]
pub struct RecordingConnector {
    recording: Recording,
    dialect: Dialect,
    failing_connects: u32,
    failing_append: Option<usize>,
    query_result: Option<Dataset>,
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            recording: Recording::default(),
            dialect: Dialect::DuckDb,
            failing_connects: 0,
            failing_append: None,
            query_result: None,
        }
    }

    /// Refuse the first `n` connection attempts
    pub fn failing_connects(mut self, n: u32) -> Self {
        self.failing_connects = n;
        self
    }

    /// Fail the `nth` append call (1-based)
    pub fn failing_append(mut self, nth: usize) -> Self {
        self.failing_append = Some(nth);
        self
    }

    /// Result returned by every `query`
    pub fn with_query_result(mut self, dataset: Dataset) -> Self {
        self.query_result = Some(dataset);
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }
}

impl Connector for RecordingConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let attempt = {
            let mut state = lock(&self.recording.state);
            state.connect_attempts += 1;
            state.connect_attempts
        };
        if attempt <= self.failing_connects {
            return Err(DbError::Connect(format!("connection refused (attempt {attempt})")));
        }
        Ok(Box::new(RecordingConnection {
            recording: self.recording.clone(),
            dialect: self.dialect,
            failing_append: self.failing_append,
            query_result: self.query_result.clone(),
        }))
    }

    fn target(&self) -> String {
        "recording".to_string()
    }
}

struct RecordingConnection {
    recording: Recording,
    dialect: Dialect,
    failing_append: Option<usize>,
    query_result: Option<Dataset>,
}

impl RecordingConnection {
    fn record(&self, sql: &str, params: &[Value]) {
        lock(&self.recording.state).statements.push(Statement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }
}

impl Connection for RecordingConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        self.record(sql, params);
        Ok(if sql.contains(" IN (") {
            params.len() as u64
        } else {
            0
        })
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Dataset, DbError> {
        self.record(sql, params);
        Ok(self
            .query_result
            .clone()
            .unwrap_or_else(|| Dataset::empty(&[])))
    }

    fn append(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<u64, DbError> {
        let mut state = lock(&self.recording.state);
        state.append_calls += 1;
        if self.failing_append == Some(state.append_calls) {
            return Err(DbError::Query(format!("append {} to {table} failed", state.append_calls)));
        }
        state.appends.push(AppendCall {
            table: table.to_string(),
            columns: columns.to_vec(),
            rows: rows.to_vec(),
        });
        Ok(rows.len() as u64)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        lock(&self.recording.state).commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        lock(&self.recording.state).rollbacks += 1;
        Ok(())
    }
}

/// In-memory [`LogStore`] keeping every flushed batch
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    batches: Arc<Mutex<Vec<Vec<LogEntry>>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Append calls so far, failed ones included
    pub fn append_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        lock(&self.batches).clone()
    }

    /// All stored entries, flattened in flush order
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), DbError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DbError::Connect("log store unavailable".to_string()));
        }
        lock(&self.batches).push(entries.to_vec());
        Ok(())
    }
}
