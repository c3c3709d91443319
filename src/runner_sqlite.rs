use crate::{
    connection::{Connector, StatementConnection},
    executor::{Executor, ExecutorOptions},
    result::{DriverError, ExecuteError},
    statement::Row,
};
use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, types::ValueRef};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Number of virtual machine instructions between statement deadline checks
const PROGRESS_CHECK_OPS: i32 = 1_000;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens SQLite connections to a database file; blocking work runs on tokio's blocking pool
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// How long a connection waits on a locked database before failing
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection, DriverError> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await??;

        Ok(SqliteConnection {
            conn: Some(conn),
            busy_timeout,
            statement_timeout: None,
        })
    }
}

/// A SQLite connection; the statement timeout is enforced by a progress handler
/// and bounds the wait on a locked database as well
pub struct SqliteConnection {
    conn: Option<Connection>,
    busy_timeout: Duration,
    statement_timeout: Option<Duration>,
}

#[async_trait]
impl StatementConnection for SqliteConnection {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.statement_timeout = Some(timeout);
        Ok(())
    }

    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>, ExecuteError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| ExecuteError::Failed(DriverError::other("connection is closed")))?;
        let sql = sql.to_string();
        let timeout = self.statement_timeout;
        let busy_timeout = self.busy_timeout;

        let (conn, rows) = tokio::task::spawn_blocking(move || {
            let rows = query_rows(&conn, &sql, timeout, busy_timeout);
            (conn, rows)
        })
        .await
        .map_err(|err| ExecuteError::Failed(err.into()))?;

        self.conn = Some(conn);
        rows
    }

    async fn close(self) -> Result<(), DriverError> {
        let Some(conn) = self.conn else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || conn.close().map_err(|(_, err)| err)).await??;
        Ok(())
    }
}

/// An interrupted statement is one the progress handler stopped at its deadline
fn classify_error(err: rusqlite::Error) -> ExecuteError {
    if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        ExecuteError::TimedOut(DriverError::Sqlite(err))
    } else {
        ExecuteError::Failed(DriverError::Sqlite(err))
    }
}

fn query_rows(
    conn: &Connection,
    sql: &str,
    timeout: Option<Duration>,
    busy_timeout: Duration,
) -> Result<Vec<Row>, ExecuteError> {
    let Some(limit) = timeout else {
        return collect_rows(conn, sql).map_err(classify_error);
    };

    // Waiting on a lock counts toward the statement deadline
    let lock_wait = limit.min(busy_timeout);
    let started = Instant::now();
    conn.busy_timeout(lock_wait).map_err(classify_error)?;
    conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || started.elapsed() >= limit));

    let rows = collect_rows(conn, sql);

    conn.progress_handler(0, None::<fn() -> bool>);
    let restored = conn.busy_timeout(busy_timeout);

    match rows {
        Ok(rows) => {
            restored.map_err(classify_error)?;
            Ok(rows)
        }
        Err(err) if is_busy(&err) && lock_wait == limit && started.elapsed() >= lock_wait => {
            Err(ExecuteError::TimedOut(DriverError::Sqlite(err)))
        }
        Err(err) => Err(classify_error(err)),
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn collect_rows(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query([])?;

    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..column_count)
            .map(|idx| row.get_ref(idx).map(sqlite_value_to_json))
            .collect::<rusqlite::Result<Row>>()?;
        result.push(values);
    }
    Ok(result)
}

/// Convert a SQLite value to JSON; blobs become arrays of bytes
pub fn sqlite_value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(r) => serde_json::Number::from_f64(r)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).to_string()),
        ValueRef::Blob(b) => serde_json::Value::Array(
            b.iter()
                .map(|&byte| serde_json::Value::Number(byte.into()))
                .collect(),
        ),
    }
}

impl Executor<SqliteConnector> {
    /// Build a SQLite executor over the database file at `path`
    pub fn sqlite(path: impl Into<PathBuf>, options: ExecutorOptions) -> Self {
        Executor::new(SqliteConnector::new(path), options)
    }
}
