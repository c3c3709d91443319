use crate::{
    result::{DriverError, ExecuteError},
    statement::Row,
};
use async_trait::async_trait;
use std::time::Duration;

/// Opens fresh database connections from stored connection parameters.
///
/// A connector is shared by every worker task of an executor, so it only holds
/// immutable parameters; each call to `connect` yields a connection owned by one task.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: StatementConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError>;
}

/// A live connection owned by exactly one worker task at a time
#[async_trait]
pub trait StatementConnection: Send + 'static {
    /// Ask the server to cancel any later statement on this connection that runs longer than `timeout`
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DriverError>;

    /// Execute one statement and fetch its complete result set.
    /// Cancellation caused by the statement timeout must be reported as `ExecuteError::TimedOut`.
    ///
    /// `sql` must be a single SQL command. Both bundled drivers prepare it as one statement,
    /// so text holding several `;`-separated commands fails with `ExecuteError::Failed`.
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>, ExecuteError>;

    async fn close(self) -> Result<(), DriverError>;
}
