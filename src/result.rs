use thiserror::Error;

/// Error raised by a database driver while connecting, configuring or closing a connection
#[derive(Error, Debug)]
pub enum DriverError {
    #[cfg(feature = "postgresql")]
    #[error("PostgreSQL error: {}", describe_postgres_error(.0))]
    Postgres(#[from] tokio_postgres::Error),
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Driver worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl DriverError {
    /// Wrap an error (or a plain message) coming from a custom connector
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        DriverError::Other(err.into())
    }
}

/// Server errors carry their message and SQLSTATE in the `DbError`, which the
/// top-level display of `tokio_postgres::Error` leaves out
#[cfg(feature = "postgresql")]
fn describe_postgres_error(err: &tokio_postgres::Error) -> String {
    let Some(db) = err.as_db_error() else {
        return err.to_string();
    };
    let mut message = format!(
        "{}: {} (SQLSTATE {})",
        db.severity(),
        db.message(),
        db.code().code()
    );
    if let Some(detail) = db.detail() {
        message.push_str(&format!("; DETAIL: {detail}"));
    }
    if let Some(hint) = db.hint() {
        message.push_str(&format!("; HINT: {hint}"));
    }
    message
}

/// Failure of a single statement execution, classified by the driver
#[derive(Error, Debug)]
pub enum ExecuteError {
    /// The server cancelled the statement (statement timeout or interrupt)
    #[error("statement cancelled: {0}")]
    TimedOut(DriverError),
    #[error(transparent)]
    Failed(DriverError),
}

impl ExecuteError {
    pub fn into_inner(self) -> DriverError {
        match self {
            ExecuteError::TimedOut(err) | ExecuteError::Failed(err) => err,
        }
    }
}

/// Main error type for batch execution
#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Connection error: {0}")]
    Connection(#[source] DriverError),
    #[error("Statement cancelled after reaching the {timeout_ms} ms statement timeout")]
    StatementTimeout { timeout_ms: u64 },
    #[error("Statement execution error: {0}")]
    StatementExecution(#[source] DriverError),
    #[error("Fallback statement execution error: {0}")]
    FallbackExecution(#[source] DriverError),
    #[error("Statement {index} failed: {source}")]
    Statement {
        index: usize,
        #[source]
        source: Box<FanoutError>,
    },
    #[error("Worker task for statement {index} did not complete: {source}")]
    Task {
        index: usize,
        #[source]
        source: tokio::task::JoinError,
    },
    #[error("Executor pool is closed")]
    PoolClosed(#[from] tokio::sync::AcquireError),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FanoutError {
    /// Attach the batch index of the failing statement
    pub fn at_index(self, index: usize) -> Self {
        FanoutError::Statement {
            index,
            source: Box::new(self),
        }
    }

    /// Batch index of the failing statement, if the error carries one
    pub fn statement_index(&self) -> Option<usize> {
        match self {
            FanoutError::Statement { index, .. } | FanoutError::Task { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The innermost task-level error, unwrapping the batch index
    pub fn cause(&self) -> &FanoutError {
        match self {
            FanoutError::Statement { source, .. } => source.cause(),
            other => other,
        }
    }
}

/// Type alias for Results using FanoutError
pub type Result<T> = std::result::Result<T, FanoutError>;
