use crate::{
    connection::{Connector, StatementConnection},
    result::{ExecuteError, FanoutError, Result},
    statement::{ExecutionResult, Row, Statement, StatementWithFallback},
};
use std::time::{Duration, Instant};

/// Run one statement end to end on its own connection(s).
///
/// The primary statement runs under `timeout` when one is given. If the server cancels it
/// because of that timeout, the cancelled connection is closed and the fallback (if any) runs
/// on a fresh connection with no timeout. Errors raised by the fallback are not caught.
pub async fn run_statement<C: Connector>(
    connector: &C,
    statement: &StatementWithFallback,
    timeout: Option<Duration>,
) -> Result<ExecutionResult> {
    let index = statement.index();
    tracing::debug!(index, sql_preview = %statement.primary.preview(), "starting statement");
    let started = Instant::now();

    let result = match run_primary(connector, &statement.primary, timeout).await {
        Ok(rows) => Ok(ExecutionResult::primary(rows)),
        Err(FanoutError::StatementTimeout { timeout_ms }) => {
            tracing::debug!(index, timeout_ms, "statement timeout reached");
            match &statement.fallback {
                None => {
                    tracing::warn!(
                        index,
                        "no fallback statement to execute, returning empty result"
                    );
                    Ok(ExecutionResult::timed_out())
                }
                Some(fallback) => run_fallback(connector, fallback)
                    .await
                    .map(ExecutionResult::fallback),
            }
        }
        Err(err) => Err(err),
    };

    tracing::debug!(
        index,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "statement finished"
    );
    result
}

/// Run a statement without a timeout guard and return its raw rows
pub async fn run_unguarded<C: Connector>(connector: &C, sql: &str) -> Result<Vec<Row>> {
    let mut conn = connector.connect().await.map_err(FanoutError::Connection)?;
    let rows = conn
        .fetch_all(sql)
        .await
        .map_err(|err| FanoutError::StatementExecution(err.into_inner()))?;
    release(conn).await;
    Ok(rows)
}

async fn run_primary<C: Connector>(
    connector: &C,
    statement: &Statement,
    timeout: Option<Duration>,
) -> Result<Vec<Row>> {
    let mut conn = connector.connect().await.map_err(FanoutError::Connection)?;
    if let Some(timeout) = timeout {
        conn.set_statement_timeout(timeout)
            .await
            .map_err(FanoutError::StatementExecution)?;
    }

    match conn.fetch_all(statement.sql()).await {
        Ok(rows) => {
            release(conn).await;
            Ok(rows)
        }
        // Only a cancellation we asked for counts as a timeout
        Err(ExecuteError::TimedOut(_)) if timeout.is_some() => {
            release(conn).await;
            Err(FanoutError::StatementTimeout {
                timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
            })
        }
        Err(err) => Err(FanoutError::StatementExecution(err.into_inner())),
    }
}

async fn run_fallback<C: Connector>(connector: &C, fallback: &Statement) -> Result<Vec<Row>> {
    tracing::debug!(
        index = fallback.index(),
        sql_preview = %fallback.preview(),
        "starting fallback statement"
    );
    let mut conn = connector.connect().await.map_err(FanoutError::Connection)?;
    let rows = conn
        .fetch_all(fallback.sql())
        .await
        .map_err(|err| FanoutError::FallbackExecution(err.into_inner()))?;
    release(conn).await;
    Ok(rows)
}

async fn release<T: StatementConnection>(conn: T) {
    if let Err(err) = conn.close().await {
        tracing::warn!(error = %err, "failed to close connection");
    }
}
