//! `PostgREST` row-store adapter.
//!
//! Thin HTTP wrapper for `/rest/v1/{table}`. Query encoding lives in
//! `query_params` so it can be tested without a server. Requests carry the
//! project key plus the signed-in user's bearer token (the anon key when
//! signed out), so row-level security on the server sees the real caller.

use serde_json::Value;
use tokio::sync::watch;

use super::realtime::{self, RealtimeConfig};
use super::{ChangeFeed, Direction, Filter, Query, Row, RowStore, StoreError};
use crate::config::ClinicConfig;
use crate::identity::gotrue::parse_error_message;
use crate::model::Session;

// =============================================================================
// CLIENT
// =============================================================================

pub struct PostgrestStore {
    http: reqwest::Client,
    rest_url: String,
    anon_key: String,
    tokens: watch::Receiver<Option<Session>>,
    realtime: RealtimeConfig,
}

impl PostgrestStore {
    /// Build a store that authenticates with whatever session `tokens` holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(config: &ClinicConfig, tokens: watch::Receiver<Option<Session>>) -> Result<Self, StoreError> {
        let http = config
            .timeouts
            .http_client()
            .map_err(|e| StoreError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            rest_url: config.rest_url(),
            anon_key: config.anon_key.clone(),
            tokens,
            realtime: RealtimeConfig::from_config(config),
        })
    }

    fn bearer(&self) -> String {
        self.tokens
            .borrow()
            .as_ref()
            .map_or_else(|| self.anon_key.clone(), |s| s.access_token.clone())
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{table}", self.rest_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, StoreError> {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| StoreError::Transport(e.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(StoreError::Rejected { status, message: parse_error_message(status, &text) });
    }
    Ok(text)
}

#[async_trait::async_trait]
impl RowStore for PostgrestStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &query.table)
            .query(&query_params(query))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let text = read_body(response).await?;
        parse_rows(&text)
    }

    /// `HEAD` with `Prefer: count=exact`; the total comes back in
    /// `Content-Range` and no rows are transferred.
    async fn count(&self, query: &Query) -> Result<usize, StoreError> {
        let params = query_params(&Query { columns: "*".into(), order: None, limit: None, ..query.clone() });
        let response = self
            .request(reqwest::Method::HEAD, &query.table)
            .header("Prefer", "count=exact")
            .query(&params)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        read_body(response).await?;
        let range = range.ok_or_else(|| StoreError::Decode("count response has no Content-Range".into()))?;
        let total = parse_content_range(&range)?;
        Ok(query.limit.map_or(total, |limit| total.min(limit)))
    }

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        read_body(response).await.map(drop)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<(), StoreError> {
        let params: Vec<(String, String)> = filters.iter().map(encode_filter).collect();
        let response = self
            .request(reqwest::Method::PATCH, table)
            .header("Prefer", "return=minimal")
            .query(&params)
            .json(&patch)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        read_body(response).await.map(drop)
    }

    async fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<ChangeFeed, StoreError> {
        Ok(realtime::subscribe(self.realtime.clone(), table, filter, self.tokens.clone()))
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Query-string pairs for a select.
pub(crate) fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_owned(), query.columns.replace(' ', ""))];
    params.extend(query.filters.iter().map(encode_filter));
    if let Some(order) = &query.order {
        let direction = match order.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        params.push(("order".to_owned(), format!("{}.{direction}", order.column)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_owned(), limit.to_string()));
    }
    params
}

pub(crate) fn encode_filter(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq(column, Value::Null) => (column.clone(), "is.null".to_owned()),
        Filter::Eq(column, value) => (column.clone(), format!("eq.{}", literal(value))),
        Filter::In(column, values) => {
            let items: Vec<String> = values.iter().map(in_item).collect();
            (column.clone(), format!("in.({})", items.join(",")))
        }
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Set members containing reserved characters must be double-quoted.
fn in_item(value: &Value) -> String {
    let raw = literal(value);
    if raw.contains([',', '(', ')', '"', ' ', '\\']) {
        format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        raw
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub(crate) fn parse_content_range(range: &str) -> Result<usize, StoreError> {
    range
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
        .ok_or_else(|| StoreError::Decode(format!("unexpected Content-Range `{range}`")))
}

fn parse_rows(text: &str) -> Result<Vec<Row>, StoreError> {
    let values: Vec<Value> = serde_json::from_str(text).map_err(|e| StoreError::Decode(e.to_string()))?;
    values
        .into_iter()
        .map(|v| match v {
            Value::Object(row) => Ok(row),
            other => Err(StoreError::Decode(format!("expected object row, got {other}"))),
        })
        .collect()
}

#[cfg(test)]
#[path = "postgrest_test.rs"]
mod tests;
