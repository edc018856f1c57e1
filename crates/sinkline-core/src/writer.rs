//! Batch writer: append a dataset to a table in bounded chunks

use crate::connect::{connect_with_retry, RetryPolicy};
use crate::dataset::Dataset;
use crate::db::Connector;
use crate::error::{SinkCause, WriteFailure};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    pub rows_written: u64,
    pub chunks: usize,
}

/// Progress after each committed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk: usize,
    pub chunk_rows: usize,
    pub rows_written: u64,
    pub total_rows: usize,
}

/// Appends datasets to one target, one connection per write.
///
/// Chunks are appended in source order; each chunk is its own unit of work.
/// A failed chunk is not retried and stops the write, leaving earlier chunks
/// committed.
pub struct BatchWriter<'a> {
    connector: &'a dyn Connector,
    batch_size: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for BatchWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("target", &self.connector.target())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl<'a> BatchWriter<'a> {
    pub fn new(connector: &'a dyn Connector) -> Self {
        Self {
            connector,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn write(&self, dataset: &Dataset, table: &str) -> Result<WriteSummary, WriteFailure> {
        self.write_with_progress(dataset, table, |_| {})
    }

    pub fn write_with_progress(
        &self,
        dataset: &Dataset,
        table: &str,
        mut on_chunk: impl FnMut(ChunkProgress),
    ) -> Result<WriteSummary, WriteFailure> {
        let fail = |rows_written: u64, cause: SinkCause| WriteFailure {
            table: table.to_string(),
            rows_written,
            cause,
        };

        if self.batch_size == 0 {
            return Err(fail(
                0,
                SinkCause::InvalidInput("batch size must be at least 1".to_string()),
            ));
        }
        let total_rows = dataset.num_rows();
        if total_rows == 0 {
            log::debug!("nothing to write to table {table}");
            return Ok(WriteSummary::default());
        }

        let mut conn = connect_with_retry(self.connector, &self.retry).map_err(|e| fail(0, e.into()))?;
        let columns = dataset.column_names();

        let mut summary = WriteSummary::default();
        for offset in (0..total_rows).step_by(self.batch_size) {
            let len = self.batch_size.min(total_rows - offset);
            let rows = dataset.slice(offset, len).rows();
            conn.append(table, &columns, &rows)
                .map_err(|e| fail(summary.rows_written, e.into()))?;

            summary.rows_written += len as u64;
            summary.chunks += 1;
            log::debug!(
                "{len} rows added to table {table} ({}/{total_rows})",
                summary.rows_written
            );
            on_chunk(ChunkProgress {
                chunk: summary.chunks,
                chunk_rows: len,
                rows_written: summary.rows_written,
                total_rows,
            });
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnector;
    use crate::value::Value;

    fn dataset(n: usize) -> Dataset {
        let rows = (0..n as i64)
            .map(|i| vec![Value::Int(i), Value::Text(format!("r{i}"))])
            .collect();
        Dataset::from_rows(vec!["id".into(), "name".into()], rows).unwrap()
    }

    #[test]
    fn splits_into_ceil_chunks() {
        let connector = RecordingConnector::new();
        let writer = BatchWriter::new(&connector).with_retry(RetryPolicy::immediate(1));
        let summary = writer.write(&dataset(2500), "Kosten").unwrap();

        assert_eq!(summary.rows_written, 2500);
        assert_eq!(summary.chunks, 3);
        assert_eq!(connector.recording().append_sizes(), vec![1000, 1000, 500]);
        assert_eq!(connector.recording().connect_attempts(), 1);
    }

    #[test]
    fn chunks_keep_source_order() {
        let connector = RecordingConnector::new();
        BatchWriter::new(&connector)
            .with_batch_size(2)
            .with_retry(RetryPolicy::immediate(1))
            .write(&dataset(5), "T")
            .unwrap();
        let appends = connector.recording().appends();
        let firsts: Vec<_> = appends.iter().map(|a| a.rows[0][0].clone()).collect();
        assert_eq!(firsts, vec![Value::Int(0), Value::Int(2), Value::Int(4)]);
        assert_eq!(appends[0].columns, vec!["id", "name"]);
    }

    #[test]
    fn failure_reports_rows_written_so_far() {
        let connector = RecordingConnector::new().failing_append(3);
        let err = BatchWriter::new(&connector)
            .with_batch_size(10)
            .with_retry(RetryPolicy::immediate(1))
            .write(&dataset(45), "T")
            .unwrap_err();
        assert_eq!(err.rows_written, 20);
        assert!(matches!(err.cause, SinkCause::Database(_)));
        // no chunk after the failing one is attempted
        assert_eq!(connector.recording().append_sizes(), vec![10, 10]);
    }

    #[test]
    fn empty_dataset_does_not_connect() {
        let connector = RecordingConnector::new();
        let summary = BatchWriter::new(&connector)
            .write(&Dataset::empty(&["id"]), "T")
            .unwrap();
        assert_eq!(summary, WriteSummary::default());
        assert_eq!(connector.recording().connect_attempts(), 0);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let connector = RecordingConnector::new();
        let err = BatchWriter::new(&connector)
            .with_batch_size(0)
            .write(&dataset(3), "T")
            .unwrap_err();
        assert!(matches!(err.cause, SinkCause::InvalidInput(_)));
    }

    #[test]
    fn connection_failure_is_typed() {
        let connector = RecordingConnector::new().failing_connects(5);
        let err = BatchWriter::new(&connector)
            .with_retry(RetryPolicy::immediate(2))
            .write(&dataset(3), "T")
            .unwrap_err();
        assert!(matches!(err.cause, SinkCause::Connection(ref c) if c.attempts == 2));
        assert_eq!(err.rows_written, 0);
    }

    #[test]
    fn progress_reports_running_total() {
        let connector = RecordingConnector::new();
        let mut seen = Vec::new();
        BatchWriter::new(&connector)
            .with_batch_size(4)
            .with_retry(RetryPolicy::immediate(1))
            .write_with_progress(&dataset(10), "T", |p| seen.push(p.rows_written))
            .unwrap();
        assert_eq!(seen, vec![4, 8, 10]);
    }
}
