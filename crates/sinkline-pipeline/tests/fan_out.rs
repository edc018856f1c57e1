//! One job fanned out over registry destinations backed by DuckDB files

use std::path::Path;

use sinkline_core::{
    AuditConfig, AuditLogger, ConnectionDescriptor, Connector, DatabaseLogStore, Dataset,
    LogContext, RetryPolicy, RunIdStrategy, Value,
};
use sinkline_pipeline::{
    load_destinations, Job, JobConfig, Outcome, Pipeline, RegistryConfig, StaticSource, Step,
};

const LOG_TABLE: &str = "CREATE TABLE Logboek (Niveau VARCHAR, Bericht VARCHAR, Datumtijd TIMESTAMP, \
     Klant VARCHAR, Bron VARCHAR, Script VARCHAR, Script_ID BIGINT, Tabel VARCHAR)";

const UREN_TABLE: &str =
    "CREATE TABLE Uren (Id BIGINT, Datum DATE, Uren DECIMAL(10,2), Klant VARCHAR)";

fn duck(path: &Path) -> Box<dyn Connector> {
    ConnectionDescriptor::parse(&format!("duckdb:{}", path.display()))
        .connector()
        .unwrap()
}

fn exec(path: &Path, sql: &str) {
    duck(path).connect().unwrap().execute(sql, &[]).unwrap();
}

fn query(path: &Path, sql: &str) -> Dataset {
    duck(path).connect().unwrap().query(sql, &[]).unwrap()
}

struct Fixture {
    _dir: tempfile::TempDir,
    registry: std::path::PathBuf,
    log: std::path::PathBuf,
    source: std::path::PathBuf,
    acme: std::path::PathBuf,
}

/// Registry with a reachable customer, an unreachable one and one of another type
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("registry.duckdb");
    let log = dir.path().join("log.duckdb");
    let source = dir.path().join("source.duckdb");
    let acme = dir.path().join("acme.duckdb");
    let globex = dir.path().join("missing").join("globex.duckdb");

    exec(
        &registry,
        "CREATE TABLE Klanten (Klantnaam VARCHAR, ConnectionString VARCHAR, Type INTEGER)",
    );
    exec(
        &registry,
        &format!(
            "INSERT INTO Klanten VALUES ('Acme', 'duckdb:{}', 1), ('Globex', 'duckdb:{}', 1), \
             ('Initech', 'duckdb::memory:', 2)",
            acme.display(),
            globex.display()
        ),
    );
    exec(&log, LOG_TABLE);
    exec(&acme, UREN_TABLE);
    exec(
        &source,
        "CREATE TABLE staging_uren (Id BIGINT, Dag VARCHAR, Aantal VARCHAR)",
    );
    exec(
        &source,
        "INSERT INTO staging_uren VALUES (1, '01-02-2024', '7.5'), (2, '2024-02-02', 'acht'), \
         (3, '20240205', '4')",
    );

    Fixture {
        _dir: dir,
        registry,
        log,
        source,
        acme,
    }
}

fn job(source: &Path) -> Job {
    let config: JobConfig = toml::from_str(&format!(
        r#"
name = "uren"
source_label = "Planning"
table = "Uren"
customer_column = "Klant"

[source]
type = "sql"
query = "SELECT Id, Dag, Aantal FROM staging_uren ORDER BY Id"
database = "duckdb:{}"

[columns]
Dag = "Datum"
Aantal = "Uren"

[types]
Datum = "date"
Uren = "decimal"

[reset]
scope = "keys"
column = "Id"
"#,
        source.display()
    ))
    .unwrap();
    Job::from_config(config).unwrap()
}

fn audit(log: &Path, retry: RetryPolicy) -> AuditLogger {
    let log_connector = duck(log);
    let run_id = RunIdStrategy::MaxPlusOne {
        table: "Logboek".into(),
        column: "Script_ID".into(),
    }
    .allocate(log_connector.as_ref(), &retry)
    .unwrap();
    let store = DatabaseLogStore::new(log_connector).with_retry(retry);
    let mut audit = AuditLogger::new(
        Box::new(store),
        LogContext::new("", "", "", run_id),
        AuditConfig::default(),
    );
    audit.start_run();
    audit
}

#[test]
fn failing_destination_does_not_stop_the_others() {
    let fx = fixture();
    let retry = RetryPolicy::immediate(1);
    let destinations =
        load_destinations(duck(&fx.registry).as_ref(), &retry, &RegistryConfig::default()).unwrap();
    assert_eq!(destinations.len(), 3);

    let job = job(&fx.source);
    for run in 1..=2 {
        let mut audit = audit(&fx.log, retry);
        assert_eq!(audit.run_id(), run);

        let report = Pipeline::new(&job, job.build_source(retry))
            .with_retry(retry)
            .run(&mut audit, &destinations);

        assert!(matches!(
            report.outcome("Acme"),
            Some(Outcome::Loaded { written: 3, .. })
        ));
        assert!(matches!(
            report.outcome("Globex"),
            Some(Outcome::Failed { step: Step::Reset, .. })
        ));
        assert!(matches!(report.outcome("Initech"), Some(Outcome::Skipped)));
        assert_eq!(report.rows_written(), 3);

        audit.end_run();
        audit.close().unwrap();
    }

    // reload replaced the same keys instead of appending
    let acme = query(&fx.acme, "SELECT Id, Uren, Klant FROM Uren ORDER BY Id");
    assert_eq!(acme.num_rows(), 3);
    assert_eq!(acme.row(0), vec![Value::Int(1), Value::Float(7.5), Value::from("Acme")]);
    assert_eq!(acme.row(1)[1], Value::Float(0.0));

    let errors = query(
        &fx.log,
        "SELECT Klant, Bron, Script, Tabel, Bericht FROM Logboek WHERE Niveau = 'ERROR' ORDER BY Script_ID",
    );
    assert_eq!(errors.num_rows(), 2);
    let first = errors.row(0);
    assert_eq!(first[0], Value::from("Globex"));
    assert_eq!(first[1], Value::from("Planning"));
    assert_eq!(first[2], Value::from("uren"));
    assert_eq!(first[3], Value::from("Uren"));
    assert!(first[4]
        .as_str()
        .unwrap()
        .starts_with("FOUTMELDING | reset failed for Globex"));

    let warnings = query(
        &fx.log,
        "SELECT Bericht FROM Logboek WHERE Niveau = 'WARNING' AND Klant = 'Acme'",
    );
    assert_eq!(warnings.num_rows(), 2);
    assert!(warnings.row(0)[0].as_str().unwrap().contains("acht"));
}

#[test]
fn empty_fetch_leaves_destination_untouched() {
    let fx = fixture();
    exec(
        &fx.acme,
        "INSERT INTO Uren VALUES (9, DATE '2024-01-01', 1.00, 'Acme')",
    );
    let retry = RetryPolicy::immediate(1);
    let destinations =
        load_destinations(duck(&fx.registry).as_ref(), &retry, &RegistryConfig::default()).unwrap();

    let job = job(&fx.source);
    let empty = StaticSource::new("Planning", Dataset::empty(&["Id", "Dag", "Aantal"]));
    let mut audit = audit(&fx.log, retry);
    let report = Pipeline::new(&job, Box::new(empty))
        .with_retry(retry)
        .run(&mut audit, &destinations);
    audit.close().unwrap();

    assert!(matches!(
        report.outcome("Acme"),
        Some(Outcome::Failed { step: Step::Transform, .. })
    ));
    assert_eq!(report.failed(), 2);
    assert_eq!(
        query(&fx.acme, "SELECT count(*) FROM Uren").row(0)[0],
        Value::Int(1)
    );
}
