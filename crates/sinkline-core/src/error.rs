//! Failure taxonomy shared by the sink components and the pipeline driver

use std::fmt;

use crate::db::DbError;

/// Connection could not be established within the retry budget.
#[derive(Debug)]
pub struct ConnectionFailure {
    pub target: String,
    pub attempts: u32,
    pub last_error: DbError,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not connect to {} after {} attempt(s): {}",
            self.target, self.attempts, self.last_error
        )
    }
}

impl std::error::Error for ConnectionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Underlying reason a write or reset stopped.
#[derive(Debug)]
pub enum SinkCause {
    Connection(ConnectionFailure),
    Database(DbError),
    InvalidInput(String),
}

impl fmt::Display for SinkCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "{e}"),
            Self::Database(e) => write!(f, "{e}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl From<ConnectionFailure> for SinkCause {
    fn from(e: ConnectionFailure) -> Self {
        Self::Connection(e)
    }
}

impl From<DbError> for SinkCause {
    fn from(e: DbError) -> Self {
        Self::Database(e)
    }
}

/// Batch write aborted; `rows_written` chunks before the failure stay committed.
#[derive(Debug)]
pub struct WriteFailure {
    pub table: String,
    pub rows_written: u64,
    pub cause: SinkCause,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "writing to table {} failed after {} row(s): {}",
            self.table, self.rows_written, self.cause
        )
    }
}

impl std::error::Error for WriteFailure {}

/// Reset aborted; earlier committed chunks stay deleted.
#[derive(Debug)]
pub struct ResetFailure {
    pub table: String,
    pub rows_deleted: u64,
    pub cause: SinkCause,
}

impl fmt::Display for ResetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clearing table {} failed after {} row(s) deleted: {}",
            self.table, self.rows_deleted, self.cause
        )
    }
}

impl std::error::Error for ResetFailure {}

/// Dataset shape or column typing problem; the dataset is skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformFailure {
    MissingColumn { column: String },
    UnknownType { column: String, type_name: String },
    RaggedRow { row: usize, expected: usize, found: usize },
    EmptyDataset,
    NoDates { column: String },
    InvalidRecord { row: usize, reason: String },
}

impl fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingColumn { column } => write!(f, "column '{column}' not found in dataset"),
            Self::UnknownType { column, type_name } => {
                write!(f, "unknown data type '{type_name}' for column '{column}'")
            }
            Self::RaggedRow {
                row,
                expected,
                found,
            } => write!(f, "row {row} has {found} value(s), expected {expected}"),
            Self::EmptyDataset => write!(f, "dataset is empty"),
            Self::NoDates { column } => write!(f, "column '{column}' holds no dates"),
            Self::InvalidRecord { row, reason } => write!(f, "invalid record at row {row}: {reason}"),
        }
    }
}

impl std::error::Error for TransformFailure {}

/// An upstream system refused or returned something unusable.
#[derive(Debug)]
pub struct ExternalSourceFailure {
    pub origin: String,
    pub message: String,
}

impl ExternalSourceFailure {
    pub fn new(origin: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            origin: origin.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ExternalSourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)
    }
}

impl std::error::Error for ExternalSourceFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failure_reports_progress() {
        let err = WriteFailure {
            table: "Kosten".into(),
            rows_written: 2000,
            cause: SinkCause::Database(DbError::Query("timeout".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("Kosten"));
        assert!(msg.contains("2000"));
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn connection_failure_exposes_source() {
        use std::error::Error;
        let err = ConnectionFailure {
            target: "db".into(),
            attempts: 3,
            last_error: DbError::Connect("refused".into()),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn transform_failure_messages() {
        let err = TransformFailure::MissingColumn {
            column: "Datum".into(),
        };
        assert_eq!(err.to_string(), "column 'Datum' not found in dataset");
    }
}
