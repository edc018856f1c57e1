//! Pipeline driver: fetch, transform, reset and write one job per destination
//!
//! Every step returns a `Result`; the first failure ends that destination's
//! run, is written to the audit log and the driver moves on to the next
//! destination.

use std::fmt;

use chrono::{Local, NaiveDate};
use sinkline_core::{
    AuditLogger, BatchWriter, Dataset, DbError, ExternalSourceFailure, ResetFailure, ResetScope,
    RetryPolicy, TableResetter, TransformFailure, Value, WriteFailure,
};

use crate::job::{Job, ResetSpec};
use crate::registry::Destination;
use crate::source::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Authenticate,
    Fetch,
    Transform,
    Reset,
    Write,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authenticate => "authenticate",
            Self::Fetch => "fetch",
            Self::Transform => "transform",
            Self::Reset => "reset",
            Self::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum StepError {
    Source(ExternalSourceFailure),
    Transform(TransformFailure),
    /// Destination descriptor could not produce a connector
    Destination(DbError),
    Reset(ResetFailure),
    Write(WriteFailure),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(e) => write!(f, "{e}"),
            Self::Transform(e) => write!(f, "{e}"),
            Self::Destination(e) => write!(f, "destination: {e}"),
            Self::Reset(e) => write!(f, "{e}"),
            Self::Write(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(e) => Some(e),
            Self::Transform(e) => Some(e),
            Self::Destination(e) => Some(e),
            Self::Reset(e) => Some(e),
            Self::Write(e) => Some(e),
        }
    }
}

impl From<ExternalSourceFailure> for StepError {
    fn from(e: ExternalSourceFailure) -> Self {
        Self::Source(e)
    }
}

impl From<TransformFailure> for StepError {
    fn from(e: TransformFailure) -> Self {
        Self::Transform(e)
    }
}

impl From<ResetFailure> for StepError {
    fn from(e: ResetFailure) -> Self {
        Self::Reset(e)
    }
}

impl From<WriteFailure> for StepError {
    fn from(e: WriteFailure) -> Self {
        Self::Write(e)
    }
}

#[derive(Debug)]
pub enum Outcome {
    Loaded { deleted: u64, written: u64 },
    Failed { step: Step, error: StepError },
    Skipped,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-destination outcomes of one job run
#[derive(Debug)]
pub struct JobReport {
    pub job: String,
    pub outcomes: Vec<(String, Outcome)>,
}

impl JobReport {
    pub fn loaded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Loaded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).count()
    }

    pub fn rows_written(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                Outcome::Loaded { written, .. } => *written,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, destination: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == destination)
            .map(|(_, o)| o)
    }
}

/// Runs one job against a list of destinations.
pub struct Pipeline<'a> {
    job: &'a Job,
    source: Box<dyn Source>,
    retry: RetryPolicy,
    today: NaiveDate,
}

impl<'a> Pipeline<'a> {
    pub fn new(job: &'a Job, source: Box<dyn Source>) -> Self {
        Self {
            job,
            source,
            retry: RetryPolicy::default(),
            today: Local::now().date_naive(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Date used to resolve relative date windows
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn run(&mut self, audit: &mut AuditLogger, destinations: &[Destination]) -> JobReport {
        let job = self.job;
        audit.set_script(job.script.as_str());
        audit.set_source(job.source_label.as_str());

        let mut outcomes = Vec::with_capacity(destinations.len());
        for destination in destinations {
            if !job.filter.admits(destination) {
                log::debug!("{}: Skip {}", job.name, destination.name);
                audit.info(format!("Skip {}", destination.name));
                outcomes.push((destination.name.clone(), Outcome::Skipped));
                continue;
            }

            audit.set_customer(destination.name.as_str());
            audit.info(format!("Start {} for {}", job.name, destination.name));
            let outcome = match self.load(audit, destination) {
                Ok((deleted, written)) => {
                    audit.info_table(
                        &job.table,
                        format!("{written} rows loaded into {} ({deleted} deleted)", job.table),
                    );
                    Outcome::Loaded { deleted, written }
                }
                Err((step, error)) => {
                    audit.error_table(&job.table, format!("{step} failed for {}: {error}", destination.name));
                    Outcome::Failed { step, error }
                }
            };
            outcomes.push((destination.name.clone(), outcome));
        }

        let report = JobReport {
            job: job.name.clone(),
            outcomes,
        };
        log::info!(
            "{}: {} loaded, {} failed, {} rows written",
            job.name,
            report.loaded(),
            report.failed(),
            report.rows_written()
        );
        report
    }

    /// Steps for one destination; the first failure ends it.
    fn load(&mut self, audit: &mut AuditLogger, destination: &Destination) -> Result<(u64, u64), (Step, StepError)> {
        let job = self.job;

        self.source
            .authenticate(destination)
            .map_err(|e| (Step::Authenticate, StepError::from(e)))?;

        let fetched = self
            .source
            .fetch(destination)
            .map_err(|e| (Step::Fetch, StepError::from(e)))?;
        audit.info(format!("{} rows fetched from {}", fetched.num_rows(), self.source.name()));

        let dataset = self.transform(audit, fetched, destination).map_err(|e| (Step::Transform, e))?;

        let connector = destination
            .descriptor
            .connector()
            .map_err(|e| (Step::Reset, StepError::Destination(e)))?;

        let scope = self.reset_scope(&dataset).map_err(|e| (Step::Reset, StepError::from(e)))?;
        let deleted = TableResetter::new(connector.as_ref())
            .with_retry(self.retry)
            .reset(&job.table, &scope)
            .map_err(|e| (Step::Reset, StepError::from(e)))?;
        audit.info_table(&job.table, format!("{deleted} rows deleted from table {} ({scope})", job.table));

        let summary = BatchWriter::new(connector.as_ref())
            .with_batch_size(job.batch_size)
            .with_retry(self.retry)
            .write_with_progress(&dataset, &job.table, |p| {
                audit.info_table(
                    &job.table,
                    format!("{} rows added to table {} ({}/{})", p.chunk_rows, job.table, p.rows_written, p.total_rows),
                );
            })
            .map_err(|e| (Step::Write, StepError::from(e)))?;

        Ok((deleted, summary.rows_written))
    }

    /// Rename, coerce types, then stamp the customer column
    fn transform(
        &self,
        audit: &mut AuditLogger,
        fetched: Dataset,
        destination: &Destination,
    ) -> Result<Dataset, StepError> {
        let job = self.job;
        if fetched.is_empty() {
            return Err(TransformFailure::EmptyDataset.into());
        }
        let renamed = job.columns.apply(&fetched);
        let (mut dataset, report) = job.types.apply(&renamed)?;
        for warning in report.warnings() {
            audit.warn(warning);
        }
        if let Some(column) = &job.customer_column {
            dataset = dataset.with_constant_column(column, Value::from(destination.name.as_str()));
        }
        Ok(dataset)
    }

    fn reset_scope(&self, dataset: &Dataset) -> Result<ResetScope, TransformFailure> {
        match &self.job.reset {
            ResetSpec::All => Ok(ResetScope::All),
            ResetSpec::Keys { column } => ResetScope::keys_from(dataset, column),
            ResetSpec::DateRange { column, window } => {
                let (start, end) = window.resolve(dataset, column, self.today)?;
                Ok(ResetScope::DateRange {
                    column: column.clone(),
                    start,
                    end,
                })
            }
        }
    }
}
