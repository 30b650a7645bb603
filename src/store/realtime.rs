//! Realtime change feed over the Phoenix channel protocol.
//!
//! ARCHITECTURE
//! ============
//! One websocket per subscription. The feed task joins a single channel with
//! a `postgres_changes` config for one table (optionally filtered, e.g.
//! `recipient_id=eq.<id>`), forwards each change as a [`ChangeEvent`], sends
//! a heartbeat on the `phoenix` topic, and pushes the new access token
//! whenever the session watch changes.
//!
//! ERROR HANDLING
//! ==============
//! Socket errors, join rejections, and server-side channel closes end the
//! current connection; the task reconnects with capped exponential backoff
//! plus jitter. The task exits once the consumer drops its `ChangeFeed`.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeFeed, ChangeKind, Filter, Row, StoreError};
use crate::config::ClinicConfig;
use crate::model::Session;

const FEED_CAPACITY: usize = 64;
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30_000;
const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Clone)]
pub struct RealtimeConfig {
    pub socket_url: String,
    pub anon_key: String,
    pub heartbeat: Duration,
}

impl RealtimeConfig {
    #[must_use]
    pub fn from_config(config: &ClinicConfig) -> Self {
        Self {
            socket_url: websocket_url(&config.supabase_url, &config.anon_key),
            anon_key: config.anon_key.clone(),
            heartbeat: Duration::from_secs(config.realtime_heartbeat_secs),
        }
    }
}

/// Spawn the feed task for `table` and return its consumer handle.
#[must_use]
pub fn subscribe(
    config: RealtimeConfig,
    table: &str,
    filter: Option<Filter>,
    tokens: watch::Receiver<Option<Session>>,
) -> ChangeFeed {
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    let table = table.to_owned();
    let task = tokio::spawn(run_feed(config, table, filter, tokens, tx));
    ChangeFeed::new(rx, Some(task))
}

// =============================================================================
// CONNECTION LOOP
// =============================================================================

async fn run_feed(
    config: RealtimeConfig,
    table: String,
    filter: Option<Filter>,
    mut tokens: watch::Receiver<Option<Session>>,
    tx: mpsc::Sender<ChangeEvent>,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match connect_and_stream(&config, &table, filter.as_ref(), &mut tokens, &tx, &mut backoff_ms).await {
            Ok(()) => debug!(%table, "realtime connection closed"),
            Err(e) => warn!(%table, error = %e, "realtime connection failed"),
        }

        if tx.is_closed() {
            return;
        }

        let jitter = rand::rng().random_range(0..=backoff_ms / 4);
        tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    }
}

async fn connect_and_stream(
    config: &RealtimeConfig,
    table: &str,
    filter: Option<&Filter>,
    tokens: &mut watch::Receiver<Option<Session>>,
    tx: &mpsc::Sender<ChangeEvent>,
    backoff_ms: &mut u64,
) -> Result<(), StoreError> {
    let (socket, _) = connect_async(config.socket_url.as_str())
        .await
        .map_err(|e| StoreError::Realtime(e.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let topic = topic_for(table, filter);
    let mut msg_ref: u64 = 1;
    let token = access_token(tokens, &config.anon_key);
    send(&mut sink, &join_frame(&topic, table, filter, &token, msg_ref)).await?;

    let mut heartbeat = tokio::time::interval(config.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    heartbeat.tick().await;
    let mut tokens_open = true;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(message) = incoming else {
                    return Ok(());
                };
                let message = message.map_err(|e| StoreError::Realtime(e.to_string()))?;
                match message {
                    Message::Text(text) => match parse_inbound(text.as_str(), &topic)? {
                        Inbound::Change(event) => {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        Inbound::Joined => {
                            *backoff_ms = INITIAL_BACKOFF_MS;
                            info!(%topic, "realtime channel joined");
                        }
                        Inbound::Rejected(reason) => {
                            return Err(StoreError::Realtime(format!("join rejected: {reason}")));
                        }
                        Inbound::Closed(reason) => {
                            return Err(StoreError::Realtime(format!("channel closed: {reason}")));
                        }
                        Inbound::Ignored => {}
                    },
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                msg_ref += 1;
                send(&mut sink, &heartbeat_frame(msg_ref)).await?;
            }
            changed = tokens.changed(), if tokens_open => {
                if changed.is_err() {
                    tokens_open = false;
                } else {
                    msg_ref += 1;
                    let token = access_token(tokens, &config.anon_key);
                    send(&mut sink, &access_token_frame(&topic, &token, msg_ref)).await?;
                }
            }
            () = tx.closed() => return Ok(()),
        }
    }
}

async fn send<S>(sink: &mut S, frame: &Value) -> Result<(), StoreError>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|e| StoreError::Realtime(e.to_string()))
}

fn access_token(tokens: &watch::Receiver<Option<Session>>, anon_key: &str) -> String {
    tokens
        .borrow()
        .as_ref()
        .map_or_else(|| anon_key.to_owned(), |s| s.access_token.clone())
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

pub(crate) fn websocket_url(supabase_url: &str, anon_key: &str) -> String {
    let base = if let Some(rest) = supabase_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = supabase_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        supabase_url.to_owned()
    };
    format!("{base}/realtime/v1/websocket?apikey={anon_key}&vsn={PROTOCOL_VERSION}")
}

pub(crate) fn topic_for(table: &str, filter: Option<&Filter>) -> String {
    match filter.and_then(realtime_filter) {
        Some(f) => format!("realtime:public:{table}:{f}"),
        None => format!("realtime:public:{table}"),
    }
}

/// Server-side filter string, e.g. `recipient_id=eq.42`.
pub(crate) fn realtime_filter(filter: &Filter) -> Option<String> {
    let (column, value) = super::postgrest::encode_filter(filter);
    match filter {
        Filter::Eq(_, Value::Null) => None,
        Filter::Eq(..) | Filter::In(..) => Some(format!("{column}={value}")),
    }
}

pub(crate) fn join_frame(topic: &str, table: &str, filter: Option<&Filter>, access_token: &str, msg_ref: u64) -> Value {
    let mut change = json!({ "event": "*", "schema": "public", "table": table });
    if let Some(f) = filter.and_then(realtime_filter) {
        change["filter"] = Value::String(f);
    }
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        },
        "ref": msg_ref.to_string(),
        "join_ref": msg_ref.to_string(),
    })
}

pub(crate) fn heartbeat_frame(msg_ref: u64) -> Value {
    json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": msg_ref.to_string() })
}

pub(crate) fn access_token_frame(topic: &str, access_token: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic,
        "event": "access_token",
        "payload": { "access_token": access_token },
        "ref": msg_ref.to_string(),
    })
}

#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Change(ChangeEvent),
    Joined,
    Rejected(String),
    Closed(String),
    Ignored,
}

/// Classify one server frame addressed to `topic`.
pub(crate) fn parse_inbound(text: &str, topic: &str) -> Result<Inbound, StoreError> {
    let frame: Value = serde_json::from_str(text).map_err(|e| StoreError::Decode(e.to_string()))?;
    if frame.get("topic").and_then(Value::as_str) != Some(topic) {
        return Ok(Inbound::Ignored);
    }

    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
    let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();
    match event {
        "postgres_changes" => parse_change(&payload).map(Inbound::Change),
        "phx_reply" => {
            if payload.get("status").and_then(Value::as_str) == Some("ok") {
                Ok(Inbound::Joined)
            } else {
                Ok(Inbound::Rejected(reason(&payload["response"])))
            }
        }
        "system" if payload.get("status").and_then(Value::as_str) == Some("error") => {
            Ok(Inbound::Rejected(reason(&payload)))
        }
        "phx_close" | "phx_error" => Ok(Inbound::Closed(event.to_owned())),
        _ => Ok(Inbound::Ignored),
    }
}

fn reason(value: &Value) -> String {
    ["reason", "message"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_owned()
}

fn parse_change(payload: &Value) -> Result<ChangeEvent, StoreError> {
    let data = payload
        .get("data")
        .ok_or_else(|| StoreError::Decode("postgres_changes without data".into()))?;
    let kind = match data.get("type").and_then(Value::as_str) {
        Some("INSERT") => ChangeKind::Insert,
        Some("UPDATE") => ChangeKind::Update,
        Some("DELETE") => ChangeKind::Delete,
        other => return Err(StoreError::Decode(format!("unknown change type {other:?}"))),
    };
    let table = data
        .get("table")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Ok(ChangeEvent { table, kind, record: non_empty_row(data.get("record")), old_record: non_empty_row(data.get("old_record")) })
}

fn non_empty_row(value: Option<&Value>) -> Option<Row> {
    value
        .and_then(Value::as_object)
        .filter(|row| !row.is_empty())
        .cloned()
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
