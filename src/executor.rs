//! Executor pool
//!
//! Dispatches a batch of statements across at most `pool_size` concurrent workers and
//! returns their results in submission order.

use crate::{
    connection::Connector,
    result::{FanoutError, Result},
    runner,
    statement::{Batch, ExecutionResult, Row, StatementWithFallback},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

pub const DEFAULT_POOL_SIZE: usize = 20;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Largest timeout PostgreSQL's `statement_timeout` accepts
pub const MAX_TIMEOUT_MS: u64 = i32::MAX as u64;

/// Pool size and statement timeout of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Maximum number of statements in flight; `<= 1` runs statements sequentially
    pub pool_size: usize,
    /// Statement timeout in milliseconds (0 = no timeout)
    pub timeout_ms: u64,
}

impl ExecutorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn is_parallel(&self) -> bool {
        self.pool_size > 1
    }

    /// Reject a timeout the server could not represent
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(FanoutError::Config(format!(
                "timeout_ms {} exceeds the maximum of {MAX_TIMEOUT_MS}",
                self.timeout_ms
            )));
        }
        Ok(())
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Runs batches of independent statements with bounded parallelism.
///
/// Cloning is cheap and clones share the same connection budget.
pub struct Executor<C: Connector> {
    connector: Arc<C>,
    options: ExecutorOptions,
    permits: Arc<Semaphore>,
}

impl<C: Connector> Clone for Executor<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            options: self.options,
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<C: Connector> Executor<C> {
    pub fn new(connector: C, options: ExecutorOptions) -> Self {
        Self {
            connector: Arc::new(connector),
            permits: Arc::new(Semaphore::new(options.pool_size.max(1))),
            options,
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Execute statements in parallel, returning one result per statement in submission order
    pub async fn execute_batch<I, S>(&self, statements: I) -> Result<Vec<ExecutionResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute(Batch::from_statements(statements)).await
    }

    /// Execute (primary, fallback) pairs in parallel; a fallback runs when its primary times out
    pub async fn execute_batch_with_fallback<I, S, F>(
        &self,
        statements: I,
    ) -> Result<Vec<ExecutionResult>>
    where
        I: IntoIterator<Item = (S, Option<F>)>,
        S: Into<String>,
        F: Into<String>,
    {
        self.execute(Batch::from_pairs(statements)).await
    }

    /// Execute a batch. Either every statement yields a result, or the call fails with the
    /// lowest failing statement index; no partial results are returned.
    pub async fn execute(&self, batch: Batch) -> Result<Vec<ExecutionResult>> {
        let count = batch.len();
        tracing::debug!(count, parallel = self.options.is_parallel(), "preparing to execute statements");
        let started = Instant::now();

        let results = if self.options.is_parallel() {
            self.dispatch_parallel(batch).await
        } else {
            self.dispatch_sequential(batch).await
        };

        tracing::debug!(
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = results.is_ok(),
            "batch finished"
        );
        results
    }

    /// Execute one statement on the caller's task, outside the pool and without a timeout
    pub async fn execute_single(&self, sql: &str) -> Result<Vec<Row>> {
        let started = Instant::now();
        let rows = runner::run_unguarded(self.connector.as_ref(), sql).await?;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            rows = rows.len(),
            "single statement finished"
        );
        Ok(rows)
    }

    async fn dispatch_sequential(&self, batch: Batch) -> Result<Vec<ExecutionResult>> {
        let mut results = Vec::with_capacity(batch.len());

        // One statement in flight at a time; the next one starts after the previous task settles
        for statement in batch {
            let index = statement.index();
            let joined = self.spawn_statement(statement).await;
            results.push(settle(index, joined)?);
        }

        Ok(results)
    }

    async fn dispatch_parallel(&self, batch: Batch) -> Result<Vec<ExecutionResult>> {
        let handles: Vec<_> = batch
            .into_iter()
            .map(|statement| (statement.index(), self.spawn_statement(statement)))
            .collect();

        // Wait for every task so that no connection outlives the call
        let mut results = Vec::with_capacity(handles.len());
        let mut first_failure = None;
        for (index, handle) in handles {
            match settle(index, handle.await) {
                Ok(result) => results.push(result),
                Err(failure) => {
                    first_failure.get_or_insert(failure);
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Run one statement on its own task under a pool permit
    fn spawn_statement(&self, statement: StatementWithFallback) -> JoinHandle<Result<ExecutionResult>> {
        let connector = Arc::clone(&self.connector);
        let permits = Arc::clone(&self.permits);
        let timeout = self.options.timeout();

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            runner::run_statement(connector.as_ref(), &statement, timeout).await
        })
    }
}

/// Attach the statement index to a failure; a task that panicked or was aborted is a `Task` error
fn settle(
    index: usize,
    joined: std::result::Result<Result<ExecutionResult>, JoinError>,
) -> Result<ExecutionResult> {
    let failure = match joined {
        Ok(Ok(result)) => return Ok(result),
        Ok(Err(err)) => err.at_index(index),
        Err(source) => FanoutError::Task { index, source },
    };
    tracing::warn!(index, error = %failure, "statement failed");
    Err(failure)
}
