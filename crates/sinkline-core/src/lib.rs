//! Sinkline Core - resilient batch data sink for SQL destinations
//!
//! Reset-then-reload of destination tables: connect with bounded retry,
//! clear the scope being replaced, append the dataset in chunks and keep a
//! buffered audit trail of every step in a shared log table.

pub mod audit;
pub mod connect;
pub mod dataset;
pub mod db;
pub mod error;
pub mod logging;
pub mod reset;
pub mod run_id;
pub mod runtime;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transform;
pub mod value;
pub mod writer;

// Re-exports for convenience
pub use audit::{
    AuditConfig, AuditError, AuditLogger, AuditState, DatabaseLogStore, LogContext, LogEntry,
    LogStore, Severity, ERROR_MARKER,
};
pub use connect::{connect_with_retry, RetryPolicy};
pub use dataset::Dataset;
pub use db::{Connection, ConnectionDescriptor, Connector, DbError, Dialect};
pub use error::{
    ConnectionFailure, ExternalSourceFailure, ResetFailure, SinkCause, TransformFailure,
    WriteFailure,
};
pub use logging::init_logging;
pub use reset::{ResetScope, TableResetter};
pub use run_id::RunIdStrategy;
pub use runtime::SHARED_RUNTIME;
pub use transform::{CoercionReport, ColumnMapping, SqlType, TypeMapping};
pub use value::Value;
pub use writer::{BatchWriter, WriteSummary};
