use serde::Serialize;

/// A single result row; column values in select-list order
pub type Row = Vec<serde_json::Value>;

/// An opaque SQL command identified by its position in the submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    index: usize,
    sql: String,
}

impl Statement {
    pub fn new(index: usize, sql: impl Into<String>) -> Self {
        Self {
            index,
            sql: sql.into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Leading part of the SQL text, for log lines
    pub fn preview(&self) -> String {
        self.sql.chars().take(100).collect()
    }
}

/// A primary statement and the statement to run instead if the primary is cancelled by the timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementWithFallback {
    pub primary: Statement,
    pub fallback: Option<Statement>,
}

impl StatementWithFallback {
    pub fn new(index: usize, sql: impl Into<String>, fallback: Option<impl Into<String>>) -> Self {
        Self {
            primary: Statement::new(index, sql),
            fallback: fallback.map(|sql| Statement::new(index, sql)),
        }
    }

    pub fn index(&self) -> usize {
        self.primary.index
    }
}

/// Ordered statements submitted together; a statement's identity is its position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    statements: Vec<StatementWithFallback>,
}

impl Batch {
    /// Build a batch of statements without fallbacks
    pub fn from_statements<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statements = statements
            .into_iter()
            .enumerate()
            .map(|(index, sql)| StatementWithFallback::new(index, sql, None::<String>))
            .collect();
        Self { statements }
    }

    /// Build a batch from (primary, optional fallback) pairs
    pub fn from_pairs<I, S, F>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<F>)>,
        S: Into<String>,
        F: Into<String>,
    {
        let statements = pairs
            .into_iter()
            .enumerate()
            .map(|(index, (sql, fallback))| StatementWithFallback::new(index, sql, fallback))
            .collect();
        Self { statements }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StatementWithFallback> {
        self.statements.iter()
    }
}

impl IntoIterator for Batch {
    type Item = StatementWithFallback;
    type IntoIter = std::vec::IntoIter<StatementWithFallback>;

    fn into_iter(self) -> Self::IntoIter {
        self.statements.into_iter()
    }
}

/// Which statement produced an execution result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Primary,
    Fallback,
    /// The primary hit the statement timeout and no fallback was supplied
    TimedOut,
}

/// Rows produced by the statement that ultimately succeeded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub outcome: Outcome,
}

impl ExecutionResult {
    pub fn primary(rows: Vec<Row>) -> Self {
        Self {
            rows,
            outcome: Outcome::Primary,
        }
    }

    pub fn fallback(rows: Vec<Row>) -> Self {
        Self {
            rows,
            outcome: Outcome::Fallback,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            rows: Vec::new(),
            outcome: Outcome::TimedOut,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_assigns_submission_indices() {
        let batch = Batch::from_statements(["SELECT 1", "SELECT 2", "SELECT 3"]);

        assert_eq!(batch.len(), 3);
        for (position, statement) in batch.iter().enumerate() {
            assert_eq!(statement.index(), position);
            assert!(statement.fallback.is_none());
        }
        assert_eq!(batch.iter().nth(1).unwrap().primary.sql(), "SELECT 2");
    }

    #[test]
    fn test_batch_from_pairs_shares_index_with_fallback() {
        let batch = Batch::from_pairs([("SELECT 1", None), ("SELECT slow()", Some("SELECT 2"))]);

        let second = batch.iter().nth(1).unwrap();
        let fallback = second.fallback.as_ref().unwrap();
        assert_eq!(fallback.index(), 1);
        assert_eq!(fallback.sql(), "SELECT 2");
        assert!(batch.iter().next().unwrap().fallback.is_none());
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::from_statements(Vec::<String>::new());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_preview_truncates_long_sql() {
        let sql = format!("SELECT '{}'", "x".repeat(500));
        let statement = Statement::new(0, sql);
        assert_eq!(statement.preview().chars().count(), 100);
    }

    #[test]
    fn test_execution_result_serializes_outcome() {
        let result = ExecutionResult::fallback(vec![vec![serde_json::json!(2)]]);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, serde_json::json!({"rows": [[2]], "outcome": "fallback"}));
        assert!(ExecutionResult::timed_out().is_empty());
    }
}
