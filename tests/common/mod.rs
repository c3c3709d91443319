//! Scripted connector for exercising the executor without a database.
//!
//! Statement text drives the behaviour of the fake connection:
//! - `value:N` returns a single row `[N]`
//! - `sleep:MS:N` waits MS milliseconds then returns `[N]`; if a statement timeout shorter than
//!   MS was set on the connection it waits for the timeout and reports a cancellation instead
//! - `cancel` reports a cancellation immediately
//! - `fail` reports an execution error; `fail:MS` does so after waiting MS milliseconds
//! - `panic` panics inside the driver
#![allow(dead_code)]

use async_trait::async_trait;
use sqlfanout::{Connector, DriverError, ExecuteError, Row, StatementConnection};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub sql: String,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
pub struct ScriptState {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    connect_budget: Option<usize>,
    executions: Mutex<Vec<Execution>>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<ScriptState>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection attempt after the first `budget` ones
    pub fn with_connect_budget(budget: usize) -> Self {
        Self {
            state: Arc::new(ScriptState {
                connect_budget: Some(budget),
                ..ScriptState::default()
            }),
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn opened_connections(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed_connections(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.state.executions.lock().unwrap().clone()
    }

    pub fn execution_of(&self, sql: &str) -> Option<Execution> {
        self.executions().into_iter().find(|e| e.sql == sql)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection, DriverError> {
        let attempt = self.state.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(budget) = self.state.connect_budget {
            if attempt >= budget {
                return Err(DriverError::other("connection refused"));
            }
        }

        let now_open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now_open, Ordering::SeqCst);
        Ok(ScriptedConnection {
            state: Arc::clone(&self.state),
            timeout: None,
        })
    }
}

pub struct ScriptedConnection {
    state: Arc<ScriptState>,
    timeout: Option<Duration>,
}

fn single_value(value: &str) -> Vec<Row> {
    let value: i64 = value.parse().expect("scripted value must be an integer");
    vec![vec![serde_json::json!(value)]]
}

#[async_trait]
impl StatementConnection for ScriptedConnection {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.timeout = Some(timeout);
        Ok(())
    }

    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>, ExecuteError> {
        self.state.executions.lock().unwrap().push(Execution {
            sql: sql.to_string(),
            timeout: self.timeout,
        });

        let parts: Vec<&str> = sql.split(':').collect();
        match parts.as_slice() {
            ["value", value] => Ok(single_value(value)),
            ["sleep", ms, value] => {
                let wanted = Duration::from_millis(ms.parse().expect("sleep must be in ms"));
                match self.timeout {
                    Some(limit) if limit < wanted => {
                        tokio::time::sleep(limit).await;
                        Err(ExecuteError::TimedOut(DriverError::other(
                            "canceling statement due to statement timeout",
                        )))
                    }
                    _ => {
                        tokio::time::sleep(wanted).await;
                        Ok(single_value(value))
                    }
                }
            }
            ["cancel"] => Err(ExecuteError::TimedOut(DriverError::other(
                "canceling statement due to user request",
            ))),
            ["fail"] => Err(syntax_error()),
            ["fail", ms] => {
                tokio::time::sleep(Duration::from_millis(ms.parse().expect("delay must be in ms")))
                    .await;
                Err(syntax_error())
            }
            ["panic"] => panic!("scripted driver panic"),
            _ => Err(ExecuteError::Failed(DriverError::other(format!(
                "unknown scripted statement: {sql}"
            )))),
        }
    }

    async fn close(self) -> Result<(), DriverError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn syntax_error() -> ExecuteError {
    ExecuteError::Failed(DriverError::other("syntax error at or near \"fail\""))
}

pub fn row(value: i64) -> Vec<Row> {
    vec![vec![serde_json::json!(value)]]
}
