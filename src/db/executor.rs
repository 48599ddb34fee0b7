use crate::db::db_pool::DuckDBConnectionManager;
use crate::db::pool::{ConnectionPool, PoolError};
use crate::db::record::{Record, RowSet, Value};
use crate::validate::ValidatedSql;
use async_trait::async_trait;
use duckdb::Connection;
use duckdb::types::Value as DuckValue;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("statement did not finish within {0:?}")]
    Timeout(Duration),
    #[error("no database connection available within {0:?}")]
    ResourceExhausted(Duration),
    #[error("database connection error: {0}")]
    ConnectionError(String),
    #[error("result exceeded the {0} row limit")]
    Truncated(usize),
    #[error("database rejected the statement: {0}")]
    StatementFailed(String),
}

impl From<PoolError> for ExecutionFailure {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted(waited) => ExecutionFailure::ResourceExhausted(waited),
            PoolError::Connect(msg) => ExecutionFailure::ConnectionError(msg),
        }
    }
}

/// What to do when a result has more rows than `max_rows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowLimitPolicy {
    /// Keep the first `max_rows` rows and flag the result as truncated.
    #[default]
    Truncate,
    /// Fail with [`ExecutionFailure::Truncated`].
    Fail,
}

/// Runs validated statements. The pipeline only ever talks to this trait.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, sql: &ValidatedSql, timeout: Duration) -> Result<RowSet, ExecutionFailure>;
}

pub struct QueryExecutor {
    pool: Arc<ConnectionPool<DuckDBConnectionManager>>,
    max_rows: usize,
    on_row_limit: RowLimitPolicy,
}

struct Fetched {
    columns: Vec<String>,
    records: Vec<Record>,
    truncated: bool,
}

impl QueryExecutor {
    pub fn new(
        pool: Arc<ConnectionPool<DuckDBConnectionManager>>,
        max_rows: usize,
        on_row_limit: RowLimitPolicy,
    ) -> Self {
        Self {
            pool,
            max_rows,
            on_row_limit,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<DuckDBConnectionManager>> {
        &self.pool
    }
}

#[async_trait]
impl StatementExecutor for QueryExecutor {
    async fn execute(&self, sql: &ValidatedSql, timeout: Duration) -> Result<RowSet, ExecutionFailure> {
        let start_time = Instant::now();
        let conn = self.pool.acquire().await?;

        let sql_to_execute = sql.as_str().to_owned();
        let max_rows = self.max_rows;
        debug!("Executing SQL: {}", sql_to_execute);

        // The connection moves into the blocking task and goes back to the
        // pool when the task ends, even if we stop waiting for it.
        let blocking_task = tokio::task::spawn_blocking(move || {
            fetch_rows(&conn, &sql_to_execute, max_rows)
        });

        let fetched = match tokio::time::timeout(timeout, blocking_task).await {
            Err(_) => {
                warn!("Statement timed out after {:?}", timeout);
                return Err(ExecutionFailure::Timeout(timeout));
            }
            Ok(Err(join_err)) => {
                return Err(ExecutionFailure::StatementFailed(format!(
                    "execution task failed: {}",
                    join_err
                )));
            }
            Ok(Ok(result)) => {
                result.map_err(|e| ExecutionFailure::StatementFailed(e.to_string()))?
            }
        };

        if fetched.truncated {
            match self.on_row_limit {
                RowLimitPolicy::Truncate => {
                    warn!("Result truncated to {} rows", self.max_rows);
                }
                RowLimitPolicy::Fail => return Err(ExecutionFailure::Truncated(self.max_rows)),
            }
        }

        let elapsed = start_time.elapsed();
        info!(
            "Query executed successfully. Row count: {}, Execution time: {}ms",
            fetched.records.len(),
            elapsed.as_millis()
        );

        Ok(RowSet {
            row_count: fetched.records.len(),
            columns: fetched.columns,
            records: fetched.records,
            truncated: fetched.truncated,
            elapsed,
        })
    }
}

fn fetch_rows(conn: &Connection, sql: &str, max_rows: usize) -> duckdb::Result<Fetched> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let columns = unique_names(rows.as_ref().map(|s| s.column_names()).unwrap_or_default());

    let mut records = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if records.len() == max_rows {
            truncated = true;
            break;
        }
        let mut record = Record::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value: DuckValue = row.get(i)?;
            record.insert(name.clone(), Value::from(value));
        }
        records.push(record);
    }

    Ok(Fetched {
        columns,
        records,
        truncated,
    })
}

/// Joins can yield the same column name twice; later copies get a numeric
/// suffix so no value is lost in the record map.
fn unique_names(names: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let mut candidate = name.clone();
        let mut n = 2;
        while seen.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        seen.push(candidate);
    }
    seen
}
