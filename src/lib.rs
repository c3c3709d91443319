pub mod config;
pub mod connection;
pub mod executor;
pub mod result;
pub mod runner;
#[cfg(feature = "postgresql")]
pub mod runner_postgresql;
#[cfg(feature = "sqlite")]
pub mod runner_sqlite;
pub mod statement;

// Re-export types for convenience
pub use config::{ConnectionParams, ExecutorConfig};
pub use connection::{Connector, StatementConnection};
pub use executor::{Executor, ExecutorOptions};
pub use result::{DriverError, ExecuteError, FanoutError, Result};
pub use statement::{Batch, ExecutionResult, Outcome, Row, Statement, StatementWithFallback};

#[cfg(feature = "postgresql")]
pub use runner_postgresql::PostgresConnector;
#[cfg(feature = "sqlite")]
pub use runner_sqlite::SqliteConnector;

// Re-export third-party types used in the public API to provide fallback for dependency conflicts
pub use serde_json::Value as JsonValue;

#[cfg(feature = "postgresql")]
pub use tokio_postgres::Config as PostgresConfig;
