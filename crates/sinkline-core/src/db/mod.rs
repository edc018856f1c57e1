//! Database abstraction: connections, connectors, SQL dialects and descriptors
//!
//! Two backends implement [`Connection`]:
//! - [`mssql`]: SQL Server over tiberius, driven synchronously on the shared runtime
//! - [`duckdb`]: embedded DuckDB, used for local targets and tests

pub mod duckdb;
pub mod mssql;

use std::fmt;
use std::path::PathBuf;

use crate::dataset::Dataset;
use crate::value::Value;

/// Error from a database driver
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// Could not open a connection
    Connect(String),
    /// Statement or transaction failed
    Query(String),
    /// Column type the value model cannot represent
    Unsupported(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connect: {msg}"),
            Self::Query(msg) => write!(f, "query: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported column type: {msg}"),
        }
    }
}

impl std::error::Error for DbError {}

/// SQL flavour of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    SqlServer,
    DuckDb,
}

impl Dialect {
    /// Positional parameter marker, `index` is 1-based
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::SqlServer => format!("@P{index}"),
            Self::DuckDb => "?".to_string(),
        }
    }

    pub fn quote_ident(self, name: &str) -> String {
        match self {
            Self::SqlServer => format!("[{}]", name.replace(']', "]]")),
            Self::DuckDb => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Quote a possibly schema-qualified table name (`dbo.Kosten`)
    pub fn quote_table(self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn next_value_sql(self, sequence: &str) -> String {
        match self {
            Self::SqlServer => format!("SELECT NEXT VALUE FOR {}", self.quote_table(sequence)),
            Self::DuckDb => format!("SELECT nextval('{}')", sequence.replace('\'', "''")),
        }
    }

    /// `INSERT INTO t (a, b) VALUES (?, ?), (?, ?)` for `rows` rows
    pub fn insert_sql(self, table: &str, columns: &[String], rows: usize) -> String {
        let cols = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut next = 0usize;
        let tuples = (0..rows)
            .map(|_| {
                let marks = (0..columns.len())
                    .map(|_| {
                        next += 1;
                        self.placeholder(next)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({marks})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({cols}) VALUES {tuples}", self.quote_table(table))
    }
}

/// A live database session.
///
/// All calls block the current thread until the driver answers.
pub trait Connection {
    fn dialect(&self) -> Dialect;

    /// Parameter marker for the 1-based `index`
    fn placeholder(&self, index: usize) -> String {
        self.dialect().placeholder(index)
    }

    /// Run a statement, returning affected rows
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Run a query, returning its first result set
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Dataset, DbError>;

    /// Append rows to `table` as one unit of work
    fn append(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<u64, DbError>;

    fn begin(&mut self) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;

    /// Atomically draw the next value of a sequence object
    fn next_sequence_value(&mut self, sequence: &str) -> Result<i64, DbError> {
        let sql = self.dialect().next_value_sql(sequence);
        let ds = self.query(&sql, &[])?;
        match ds.rows().first().and_then(|r| r.first()) {
            Some(Value::Int(v)) => Ok(*v),
            other => Err(DbError::Query(format!(
                "sequence {sequence} returned {other:?}"
            ))),
        }
    }
}

/// Upper bound on rows in one `VALUES` list
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Insert `rows` as multi-row INSERTs inside one transaction.
///
/// Each statement binds at most `max_params` values. Any failure rolls the
/// whole append back.
pub(crate) fn append_in_statements<C: Connection + ?Sized>(
    conn: &mut C,
    table: &str,
    columns: &[String],
    rows: &[Vec<Value>],
    max_params: usize,
) -> Result<u64, DbError> {
    if rows.is_empty() {
        return Ok(0);
    }
    if columns.is_empty() {
        return Err(DbError::Query(format!("append to {table} without columns")));
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
        return Err(DbError::Query(format!(
            "row {i} has {} value(s), expected {}",
            row.len(),
            columns.len()
        )));
    }

    let per_statement = (max_params / columns.len()).clamp(1, MAX_ROWS_PER_INSERT);
    let dialect = conn.dialect();

    conn.begin()?;
    let mut inserted = 0u64;
    for chunk in rows.chunks(per_statement) {
        let sql = dialect.insert_sql(table, columns, chunk.len());
        let params: Vec<Value> = chunk.iter().flatten().cloned().collect();
        match conn.execute(&sql, &params) {
            Ok(n) => inserted += n,
            Err(e) => {
                if let Err(rb) = conn.rollback() {
                    log::warn!("rollback on {table} failed: {rb}");
                }
                return Err(e);
            }
        }
    }
    conn.commit()?;
    Ok(inserted)
}

/// Opens connections to one target
pub trait Connector {
    fn connect(&self) -> Result<Box<dyn Connection>, DbError>;

    /// Credential-free description for logs
    fn target(&self) -> String;
}

/// Immutable identification of one database.
///
/// `duckdb:<path>` (or `duckdb::memory:`) selects the embedded backend;
/// anything else is treated as an ADO-style SQL Server connection string.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    SqlServer(String),
    DuckDb(Option<PathBuf>),
}

impl ConnectionDescriptor {
    pub fn parse(s: &str) -> Self {
        match s.trim().strip_prefix("duckdb:") {
            Some(":memory:") | Some("") => Self::DuckDb(None),
            Some(path) => Self::DuckDb(Some(PathBuf::from(path))),
            None => Self::SqlServer(s.trim().to_string()),
        }
    }

    /// ADO string for SQL Server with SQL authentication
    pub fn sql_server(server: &str, database: &str, user: &str, password: &str) -> Self {
        let server = if server.contains(',') || server.starts_with("tcp:") {
            server.to_string()
        } else {
            format!("tcp:{server},1433")
        };
        Self::SqlServer(format!(
            "Server={server};Database={database};User Id={user};Password={password};Encrypt=true;TrustServerCertificate=false"
        ))
    }

    pub fn connector(&self) -> Result<Box<dyn Connector>, DbError> {
        match self {
            Self::SqlServer(ado) => Ok(Box::new(mssql::MssqlConnector::new(ado.clone()))),
            Self::DuckDb(Some(path)) => Ok(Box::new(duckdb::DuckDbConnector::open(path)?)),
            Self::DuckDb(None) => Ok(Box::new(duckdb::DuckDbConnector::open_in_memory()?)),
        }
    }
}

/// Drop `password=`/`pwd=` pairs from a connection string
pub fn redact(conn_str: &str) -> String {
    conn_str
        .split(';')
        .filter(|part| {
            let key = part.split('=').next().unwrap_or("").trim().to_ascii_lowercase();
            key != "password" && key != "pwd"
        })
        .collect::<Vec<_>>()
        .join(";")
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SqlServer(ado) => write!(f, "sqlserver({})", redact(ado)),
            Self::DuckDb(Some(path)) => write!(f, "duckdb({})", path.display()),
            Self::DuckDb(None) => write!(f, "duckdb(:memory:)"),
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionDescriptor({self})")
    }
}
