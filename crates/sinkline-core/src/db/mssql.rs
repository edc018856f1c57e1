//! SQL Server backend over tiberius
//!
//! tiberius is async; every call is driven to completion on
//! [`SHARED_RUNTIME`](crate::runtime::SHARED_RUNTIME) so callers stay blocking.

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::{Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{append_in_statements, redact, Connection, Connector, DbError, Dialect};
use crate::dataset::Dataset;
use crate::runtime::{CONNECT_TIMEOUT, SHARED_RUNTIME};
use crate::value::Value;

/// SQL Server accepts at most 2100 parameters per request
const MAX_PARAMS: usize = 2000;

type TdsClient = Client<Compat<TcpStream>>;

fn query_err(e: tiberius::error::Error) -> DbError {
    DbError::Query(e.to_string())
}

fn connect_err(e: impl std::fmt::Display) -> DbError {
    DbError::Connect(e.to_string())
}

/// Connector for an ADO-style connection string
pub struct MssqlConnector {
    ado: String,
}

impl MssqlConnector {
    pub fn new(ado: impl Into<String>) -> Self {
        Self { ado: ado.into() }
    }
}

impl Connector for MssqlConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let config = Config::from_ado_string(&self.ado).map_err(connect_err)?;
        let client = SHARED_RUNTIME.handle().block_on(async {
            tokio::time::timeout(CONNECT_TIMEOUT, open_client(config))
                .await
                .map_err(|_| DbError::Connect(format!("timed out after {CONNECT_TIMEOUT:?}")))?
        })?;
        Ok(Box::new(MssqlConnection { client }))
    }

    fn target(&self) -> String {
        redact(&self.ado)
    }
}

async fn open_client(config: Config) -> Result<TdsClient, DbError> {
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(connect_err)?;
    tcp.set_nodelay(true).map_err(connect_err)?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // Azure SQL gateways redirect to the node holding the database
        Err(tiberius::error::Error::Routing { host, port }) => {
            let mut config = config;
            config.host(&host);
            config.port(port);
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(connect_err)?;
            tcp.set_nodelay(true).map_err(connect_err)?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(connect_err)
        }
        Err(e) => Err(connect_err(e)),
    }
}

pub struct MssqlConnection {
    client: TdsClient,
}

impl MssqlConnection {
    async fn run_simple(client: &mut TdsClient, sql: &str) -> Result<(), DbError> {
        client
            .simple_query(sql)
            .await
            .map_err(query_err)?
            .into_results()
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

fn bind(params: &[Value]) -> Vec<&dyn ToSql> {
    params.iter().map(|v| v as &dyn ToSql).collect()
}

impl Connection for MssqlConnection {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let client = &mut self.client;
        let params = bind(params);
        SHARED_RUNTIME.handle().block_on(async {
            let result = client.execute(sql, &params).await.map_err(query_err)?;
            Ok(result.total())
        })
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Dataset, DbError> {
        let client = &mut self.client;
        let params = bind(params);
        SHARED_RUNTIME.handle().block_on(async {
            let mut stream = client.query(sql, &params).await.map_err(query_err)?;
            let columns: Vec<String> = stream
                .columns()
                .await
                .map_err(query_err)?
                .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let rows = stream.into_first_result().await.map_err(query_err)?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let values = row
                    .cells()
                    .map(|(_, data)| from_column(data))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(values);
            }
            Dataset::from_rows(columns, out).map_err(|e| DbError::Query(e.to_string()))
        })
    }

    fn append(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<u64, DbError> {
        append_in_statements(self, table, columns, rows, MAX_PARAMS)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        let client = &mut self.client;
        SHARED_RUNTIME
            .handle()
            .block_on(Self::run_simple(client, "BEGIN TRAN"))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        let client = &mut self.client;
        SHARED_RUNTIME
            .handle()
            .block_on(Self::run_simple(client, "COMMIT TRAN"))
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        let client = &mut self.client;
        SHARED_RUNTIME
            .handle()
            .block_on(Self::run_simple(client, "IF @@TRANCOUNT > 0 ROLLBACK TRAN"))
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            // untyped NULL as nvarchar converts implicitly to every column type
            Self::Null => ColumnData::String(None),
            Self::Bool(b) => ColumnData::Bit(Some(*b)),
            Self::Int(i) => ColumnData::I64(Some(*i)),
            Self::Float(x) => ColumnData::F64(Some(*x)),
            Self::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Self::Date(d) => d.to_sql(),
            Self::DateTime(dt) => dt.to_sql(),
            Self::Time(t) => t.to_sql(),
        }
    }
}

fn from_column(data: &ColumnData<'static>) -> Result<Value, DbError> {
    Ok(match data {
        ColumnData::U8(v) => Value::from(v.map(i64::from)),
        ColumnData::I16(v) => Value::from(v.map(i64::from)),
        ColumnData::I32(v) => Value::from(v.map(i64::from)),
        ColumnData::I64(v) => Value::from(*v),
        ColumnData::F32(v) => Value::from(v.map(f64::from)),
        ColumnData::F64(v) => Value::from(*v),
        ColumnData::Bit(v) => Value::from(*v),
        ColumnData::String(v) => Value::from(v.as_ref().map(|s| s.to_string())),
        ColumnData::Guid(v) => Value::from(v.map(|g| g.to_string())),
        ColumnData::Numeric(v) => Value::from(
            v.map(|n| n.value() as f64 / 10f64.powi(i32::from(n.scale()))),
        ),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            Value::from(NaiveDateTime::from_sql(data).map_err(query_err)?)
        }
        ColumnData::Date(_) => Value::from(NaiveDate::from_sql(data).map_err(query_err)?),
        ColumnData::Time(_) => Value::from(NaiveTime::from_sql(data).map_err(query_err)?),
        ColumnData::DateTimeOffset(_) => Value::from(
            DateTime::<FixedOffset>::from_sql(data)
                .map_err(query_err)?
                .map(|dt| dt.naive_local()),
        ),
        other => return Err(DbError::Unsupported(format!("{other:?}"))),
    })
}
