//! Row-store boundary: generic select/insert/update plus a realtime feed.
//!
//! DESIGN
//! ======
//! Rows are flat JSON objects (`Row`). Queries carry the table, a select
//! expression (which may embed relations, e.g. `*, babies(first_name)`),
//! equality/set filters, ordering, and a limit. Filters can also be
//! evaluated locally (`Filter::matches`) so callers can re-check what the
//! remote store returned.
//!
//! Realtime subscriptions are handed out as a [`ChangeFeed`]: an owned,
//! cancellable receiver. Dropping the feed stops the background task that
//! drives it.

pub mod postgrest;
pub mod realtime;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ErrorCode;

/// Flat key-value row. Alias to reduce noise in signatures.
pub type Row = serde_json::Map<String, Value>;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store answered with a non-success status.
    #[error("store rejected request: status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("store request failed: {0}")]
    Transport(String),

    #[error("store response parse failed: {0}")]
    Decode(String),

    #[error("realtime channel failed: {0}")]
    Realtime(String),

    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "E_STORE_REJECTED",
            Self::Transport(_) => "E_STORE_TRANSPORT",
            Self::Decode(_) => "E_STORE_DECODE",
            Self::Realtime(_) => "E_REALTIME",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Realtime(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// QUERY
// =============================================================================

/// Column predicate. Only the shapes the clinic screens need.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value` (`value = null` means `column IS NULL`).
    Eq(String, Value),
    /// `column IN (values)`.
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn one_of<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(column, _) | Self::In(column, _) => column,
        }
    }

    /// Evaluate the predicate against a row. A missing column never matches,
    /// except `Eq(_, null)`.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, Value::Null) => row.get(column).is_none_or(Value::is_null),
            Self::Eq(column, value) => row.get(column) == Some(value),
            Self::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// A read against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    /// Select expression; `*` by default.
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn from(table: impl Into<String>) -> Self {
        Self { table: table.into(), columns: "*".into(), filters: Vec::new(), order: None, limit: None }
    }

    #[must_use]
    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order = Some(Order { column: column.into(), direction });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `true` when every filter accepts the row.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

// =============================================================================
// CHANGE FEED
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row change delivered by a realtime subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Option<Row>,
    pub old_record: Option<Row>,
}

impl ChangeEvent {
    /// The row the event is about: the new record, or the old one for deletes.
    #[must_use]
    pub fn row(&self) -> Option<&Row> {
        self.record.as_ref().or(self.old_record.as_ref())
    }
}

/// Owned, cancellable stream of [`ChangeEvent`]s.
pub struct ChangeFeed {
    rx: mpsc::Receiver<ChangeEvent>,
    task: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    /// Wrap a receiver and the task feeding it (if any). The task is aborted
    /// when the feed is closed or dropped.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Next event, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Remote relational store reached by the client.
#[async_trait::async_trait]
pub trait RowStore: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Number of rows `query` would return. Stores that can count
    /// server-side should override this.
    async fn count(&self, query: &Query) -> Result<usize, StoreError> {
        Ok(self.select(query).await?.len())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError>;

    /// Apply `patch` to every row matching all `filters`.
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<(), StoreError>;

    async fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<ChangeFeed, StoreError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
