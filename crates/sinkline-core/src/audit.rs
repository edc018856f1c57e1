//! Buffered audit log written to a shared log table
//!
//! Entries are mirrored to the console logger as they are emitted and
//! written to the [`LogStore`] in batches. A failed flush keeps the buffer and
//! is reported on the console only, never through the audit log itself.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, Timelike};

use crate::connect::{connect_with_retry, RetryPolicy};
use crate::db::{Connector, DbError};
use crate::value::Value;

/// Marker prepended to error messages in the log table
pub const ERROR_MARKER: &str = "FOUTMELDING | ";

pub const DEFAULT_LOG_TABLE: &str = "Logboek";

/// Log table columns, in insert order
pub const LOG_COLUMNS: [&str; 8] = [
    "Niveau",
    "Bericht",
    "Datumtijd",
    "Klant",
    "Bron",
    "Script",
    "Script_ID",
    "Tabel",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    const fn level(self) -> log::Level {
        match self {
            Self::Info => log::Level::Info,
            Self::Warning => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

/// Fields stamped on every entry of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    pub customer: String,
    pub source: String,
    pub script: String,
    pub run_id: i64,
}

impl LogContext {
    pub fn new(
        customer: impl Into<String>,
        source: impl Into<String>,
        script: impl Into<String>,
        run_id: i64,
    ) -> Self {
        Self {
            customer: customer.into(),
            source: source.into(),
            script: script.into(),
            run_id,
        }
    }
}

/// One row of the log table. Never mutated once created.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub severity: Severity,
    pub customer: String,
    pub source: String,
    pub script: String,
    pub run_id: i64,
    pub message: String,
    pub table: Option<String>,
}

impl LogEntry {
    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.severity.label()),
            Value::from(self.message.as_str()),
            Value::DateTime(self.timestamp),
            Value::from(self.customer.as_str()),
            Value::from(self.source.as_str()),
            Value::from(self.script.as_str()),
            Value::Int(self.run_id),
            Value::from(self.table.clone()),
        ]
    }
}

/// Destination for flushed audit entries
pub trait LogStore {
    /// Persist `entries` in order, all or nothing
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), DbError>;
}

/// Log table in a database; one connection and transaction per flush.
///
/// Connects with a single attempt by default; a down log database is
/// retried by the logger's flush interval, not by sleeping here.
pub struct DatabaseLogStore {
    connector: Box<dyn Connector>,
    retry: RetryPolicy,
    table: String,
}

impl DatabaseLogStore {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            retry: RetryPolicy::immediate(1),
            table: DEFAULT_LOG_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl LogStore for DatabaseLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), DbError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = connect_with_retry(self.connector.as_ref(), &self.retry)
            .map_err(|e| DbError::Connect(e.to_string()))?;
        let columns: Vec<String> = LOG_COLUMNS.iter().map(|c| c.to_string()).collect();
        let rows: Vec<Vec<Value>> = entries.iter().map(LogEntry::to_row).collect();
        conn.append(&self.table, &columns, &rows)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditState {
    Uninitialized,
    Active,
    Flushing,
    Closed,
}

/// Flush thresholds; whichever is reached first triggers a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditConfig {
    pub buffer_size: usize,
    pub flush_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Entry was not buffered; it only reached the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditError {
    NotActive,
    Closed,
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActive => write!(f, "audit logger has not been started"),
            Self::Closed => write!(f, "audit logger is closed"),
        }
    }
}

impl std::error::Error for AuditError {}

pub struct AuditLogger {
    store: Option<Box<dyn LogStore>>,
    context: LogContext,
    config: AuditConfig,
    buffer: Vec<LogEntry>,
    state: AuditState,
    last_flush: Instant,
    /// Last flush failed; only the interval or `close` tries again
    flush_failed: bool,
    started: Option<Instant>,
}

impl AuditLogger {
    pub fn new(store: Box<dyn LogStore>, context: LogContext, config: AuditConfig) -> Self {
        Self {
            store: Some(store),
            context,
            config,
            buffer: Vec::with_capacity(config.buffer_size),
            state: AuditState::Uninitialized,
            last_flush: Instant::now(),
            flush_failed: false,
            started: None,
        }
    }

    pub fn state(&self) -> AuditState {
        self.state
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    pub fn run_id(&self) -> i64 {
        self.context.run_id
    }

    /// Entries waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Label stamped as the source on subsequent entries
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.context.source = source.into();
    }

    pub fn set_customer(&mut self, customer: impl Into<String>) {
        self.context.customer = customer.into();
    }

    pub fn set_script(&mut self, script: impl Into<String>) {
        self.context.script = script.into();
    }

    /// Start accepting entries
    pub fn activate(&mut self) {
        if self.state == AuditState::Uninitialized {
            self.state = AuditState::Active;
            self.last_flush = Instant::now();
        }
    }

    pub fn emit(&mut self, severity: Severity, message: impl Into<String>, table: Option<&str>) -> Result<(), AuditError> {
        let message = message.into();
        match table {
            Some(t) => log::log!(severity.level(), "[{}] {t}: {message}", self.context.source),
            None => log::log!(severity.level(), "[{}] {message}", self.context.source),
        }

        match self.state {
            AuditState::Uninitialized => return Err(AuditError::NotActive),
            AuditState::Closed => return Err(AuditError::Closed),
            AuditState::Active | AuditState::Flushing => {}
        }

        let now = Local::now().naive_local();
        self.buffer.push(LogEntry {
            timestamp: now.with_nanosecond(0).unwrap_or(now),
            severity,
            customer: self.context.customer.clone(),
            source: self.context.source.clone(),
            script: self.context.script.clone(),
            run_id: self.context.run_id,
            message,
            table: table.map(str::to_string),
        });

        let full = self.buffer.len() >= self.config.buffer_size && !self.flush_failed;
        if full || self.last_flush.elapsed() >= self.config.flush_interval {
            // failure is reported on the console and the buffer is kept
            let _ = self.flush();
        }
        Ok(())
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let _ = self.emit(Severity::Info, message, None);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let _ = self.emit(Severity::Warning, message, None);
    }

    /// Error entry carrying the [`ERROR_MARKER`] prefix
    pub fn error(&mut self, message: impl fmt::Display) {
        let _ = self.emit(Severity::Error, format!("{ERROR_MARKER}{message}"), None);
    }

    pub fn info_table(&mut self, table: &str, message: impl Into<String>) {
        let _ = self.emit(Severity::Info, message, Some(table));
    }

    pub fn error_table(&mut self, table: &str, message: impl fmt::Display) {
        let _ = self.emit(Severity::Error, format!("{ERROR_MARKER}{message}"), Some(table));
    }

    /// Write the whole buffer to the store as one batch.
    ///
    /// On failure the buffer is left intact and the error is logged to the
    /// console. Returns the number of entries written.
    pub fn flush(&mut self) -> Result<usize, DbError> {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let Some(store) = self.store.as_mut() else {
            return Ok(0);
        };

        let previous = self.state;
        self.state = AuditState::Flushing;
        let result = store.append(&self.buffer);
        self.state = previous;

        match result {
            Ok(()) => {
                self.flush_failed = false;
                let n = self.buffer.len();
                self.buffer.clear();
                log::debug!("flushed {n} audit entries");
                Ok(n)
            }
            Err(e) => {
                self.flush_failed = true;
                log::error!(
                    "audit flush failed, keeping {} entries: {e}",
                    self.buffer.len()
                );
                Err(e)
            }
        }
    }

    /// Activate and record the start of the run
    pub fn start_run(&mut self) {
        self.activate();
        self.started = Some(Instant::now());
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.info(format!("Script gestart om {now}"));
    }

    /// Record the total run time as `H:MM:SS`
    pub fn end_run(&mut self) {
        match self.started {
            Some(started) => {
                let elapsed = format_elapsed(started.elapsed());
                self.info(format!("Script voltooid in {elapsed}"));
            }
            None => self.warn("end_run called without start_run"),
        }
    }

    /// Final flush, then release the store. Later emits are rejected.
    pub fn close(&mut self) -> Result<(), DbError> {
        if self.state == AuditState::Closed {
            return Ok(());
        }
        let result = self.flush().map(|_| ());
        if !self.buffer.is_empty() {
            log::error!(
                "{} audit entries could not be stored and are dropped",
                self.buffer.len()
            );
            for entry in self.buffer.drain(..) {
                log::error!(
                    "  {} {} [{}] {}",
                    entry.timestamp,
                    entry.severity.label(),
                    entry.source,
                    entry.message
                );
            }
        }
        self.store = None;
        self.state = AuditState::Closed;
        result
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// `H:MM:SS`, hours unpadded
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
