//! sinkline - reset-then-reload ETL jobs for customer databases
//!
//! Runs the jobs from sinkline.toml against every registered destination and
//! records each step in the shared audit log table.

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use sinkline_core::{AuditLogger, Connector, DatabaseLogStore, LogContext, RetryPolicy};
use sinkline_pipeline::{
    load_destinations, Destination, Job, JobReport, Outcome, Pipeline, RegistryConfig,
    RegistryError,
};

mod config;

use config::{Config, Environment};

#[derive(Parser)]
#[command(name = "sinkline")]
#[command(about = "Reset-then-reload ETL jobs for customer databases")]
#[command(version)]
struct Cli {
    /// Jobs to run (default: all, in config order)
    jobs: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Config file path (default: <base_dir>/sinkline.toml, ./sinkline.toml or ~/.config/sinkline/sinkline.toml)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// List configured jobs and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    sinkline_core::init_logging(cli.debug);

    let env = Environment::load();
    log::info!("{} (base dir {})", env.label(), env.base_dir.display());

    let config = Config::load(cli.config.as_deref(), &env.base_dir)?;
    if cli.list {
        eprintln!("\n{}", jobs_table(&config));
        return Ok(());
    }

    let jobs = config.select_jobs(&cli.jobs)?;
    let retry = config.retry.policy();
    let log_db = config.log_database()?;

    let log_connector = log_db
        .connector()
        .with_context(|| format!("Failed to open log database {log_db}"))?;
    let run_id = config
        .run_id
        .strategy(&config.audit.table)
        .allocate(log_connector.as_ref(), &retry)
        .context("Failed to allocate run id")?;
    log::info!("run id {run_id}");

    // same connector as the log store, so an in-memory database is shared too
    let registry = registry_destinations(&jobs, log_connector.as_ref(), &retry, &config.registry);

    let store = DatabaseLogStore::new(log_connector).with_table(config.audit.table.as_str());
    let mut audit = AuditLogger::new(
        Box::new(store),
        LogContext::new("", "sinkline", "sinkline", run_id),
        config.audit.settings(),
    );
    audit.start_run();

    let registry = registry.unwrap_or_else(|e| {
        audit.error(format!("destination registry: {e}"));
        Vec::new()
    });

    let mut reports = Vec::with_capacity(jobs.len());
    for job in &jobs {
        reports.push(run_job(job, &registry, &mut audit, retry));
    }

    audit.set_customer("");
    audit.set_source("sinkline");
    audit.set_script("sinkline");
    audit.end_run();
    if let Err(e) = audit.close() {
        log::error!("final audit flush failed: {e}");
    }

    eprintln!("\n{}", report_table(&reports));
    // caught per-destination failures are in the audit log; the run itself succeeded
    Ok(())
}

/// Registry destinations, read only when some job has none of its own
fn registry_destinations(
    jobs: &[Job],
    connector: &dyn Connector,
    retry: &RetryPolicy,
    config: &RegistryConfig,
) -> Result<Vec<Destination>, RegistryError> {
    if jobs.iter().all(|j| !j.destinations.is_empty()) {
        return Ok(Vec::new());
    }
    load_destinations(connector, retry, config)
}

fn run_job(
    job: &Job,
    registry: &[Destination],
    audit: &mut AuditLogger,
    retry: RetryPolicy,
) -> JobReport {
    let destinations = if job.destinations.is_empty() {
        registry
    } else {
        job.destinations.as_slice()
    };
    log::info!("job {}: {} destination(s)", job.name, destinations.len());
    Pipeline::new(job, job.build_source(retry))
        .with_retry(retry)
        .run(audit, destinations)
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

fn jobs_table(config: &Config) -> Table {
    let mut table = new_table(&["Job", "Table", "Batch size", "Destinations"]);
    for job in &config.jobs {
        let destinations = if job.destinations.is_empty() {
            format!("registry (type {})", job.kind)
        } else {
            job.destinations
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        table.add_row(vec![
            job.name.clone(),
            job.table.clone(),
            job.batch_size.to_string(),
            destinations,
        ]);
    }
    table
}

fn report_table(reports: &[JobReport]) -> Table {
    let mut table = new_table(&["Job", "Destination", "Result"]);
    for report in reports {
        for (destination, outcome) in &report.outcomes {
            let result = match outcome {
                Outcome::Loaded { deleted, written } => {
                    Cell::new(format!("{written} written, {deleted} deleted")).fg(Color::Green)
                }
                Outcome::Failed { step, error } => {
                    Cell::new(format!("{step} failed: {error}")).fg(Color::Red)
                }
                Outcome::Skipped => Cell::new("skipped"),
            };
            table.add_row(vec![Cell::new(&report.job), Cell::new(destination), result]);
        }
    }
    table
}
