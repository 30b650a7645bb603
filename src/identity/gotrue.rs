//! Hosted `GoTrue` identity adapter.
//!
//! ARCHITECTURE
//! ============
//! Thin HTTP wrapper for `/auth/v1`. The client keeps the current session in
//! a `watch` channel (read by the row store and realtime feed as their token
//! source) and announces every transition on a broadcast channel. A
//! background task refreshes the access token shortly before it expires.
//! Response parsing is pure (`parse_session`, `parse_sign_up`,
//! `parse_error_message`) for testability.
//!
//! TRADE-OFFS
//! ==========
//! The refresh task holds only a `Weak` handle, so dropping the last client
//! clone stops refreshing. A refresh that fails on transport is not retried
//! by the task; the next `current_session` call retries it.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AuthEvent, IdentityProvider, ProviderError, SESSION_CHANGE_CAPACITY, SessionChange, SignUpResponse};
use crate::config::ClinicConfig;
use crate::model::{Session, SignUpRequest, now_unix};

/// Provider wording reused for the obfuscated duplicate-account response.
pub const DUPLICATE_ACCOUNT_MESSAGE: &str = "User already registered";

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

// =============================================================================
// CLIENT
// =============================================================================

/// Cheap-to-clone handle; all clones share one session.
#[derive(Clone)]
pub struct GoTrueClient {
    shared: Arc<Shared>,
}

struct Shared {
    http: reqwest::Client,
    auth_url: String,
    anon_key: String,
    refresh_margin_secs: i64,
    session: watch::Sender<Option<Session>>,
    changes: broadcast::Sender<SessionChange>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl GoTrueClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(config: &ClinicConfig) -> Result<Self, ProviderError> {
        let http = config
            .timeouts
            .http_client()
            .map_err(|e| ProviderError::HttpClientBuild(e.to_string()))?;
        let (session, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(SESSION_CHANGE_CAPACITY);
        let shared = Shared {
            http,
            auth_url: config.auth_url(),
            anon_key: config.anon_key.clone(),
            refresh_margin_secs: i64::try_from(config.refresh_margin_secs).unwrap_or(i64::MAX),
            session,
            changes,
            refresher: Mutex::new(None),
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    /// Token source for components that call the backend on the user's behalf.
    #[must_use]
    pub fn session_watch(&self) -> watch::Receiver<Option<Session>> {
        self.shared.session.subscribe()
    }
}

impl Shared {
    async fn post(&self, path: &str, query: &[(&str, &str)], body: &Value, bearer: Option<&str>) -> Result<String, ProviderError> {
        let mut request = self
            .http
            .post(format!("{}{path}", self.auth_url))
            .query(query)
            .header("apikey", &self.anon_key)
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(ProviderError::Rejected { status, message: parse_error_message(status, &text) });
        }
        Ok(text)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, ProviderError> {
        let body = json!({ "refresh_token": refresh_token });
        let text = self
            .post("/token", &[("grant_type", "refresh_token")], &body, None)
            .await?;
        parse_session(&text, now_unix())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slot = self.refresher.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

/// Store the session, reschedule refresh, and notify subscribers.
fn install(shared: &Arc<Shared>, session: Option<Session>, event: AuthEvent) {
    schedule_refresh(shared, session.as_ref());
    shared.session.send_replace(session.clone());
    // No subscribers is not an error: nothing is listening yet.
    let _ = shared.changes.send(SessionChange { event, session });
}

fn schedule_refresh(shared: &Arc<Shared>, session: Option<&Session>) {
    let mut slot = shared.refresher.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(task) = slot.take() {
        task.abort();
    }

    let Some(session) = session.filter(|s| s.can_refresh()) else {
        return;
    };
    let Some(refresh_token) = session.refresh_token.clone() else {
        return;
    };

    let due_in = session
        .expires_at
        .saturating_sub(shared.refresh_margin_secs)
        .saturating_sub(now_unix());
    let delay = Duration::from_secs(u64::try_from(due_in).unwrap_or(0));
    let weak = Arc::downgrade(shared);
    *slot = Some(tokio::spawn(refresh_when_due(weak, refresh_token, delay)));
}

async fn refresh_when_due(weak: Weak<Shared>, refresh_token: String, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(shared) = weak.upgrade() else {
        return;
    };

    match shared.refresh(&refresh_token).await {
        Ok(session) => {
            debug!(user_id = %session.user_id, expires_at = session.expires_at, "access token refreshed");
            install(&shared, Some(session), AuthEvent::TokenRefreshed);
        }
        Err(ProviderError::Rejected { status, message }) => {
            warn!(status, %message, "refresh token rejected; signing out");
            install(&shared, None, AuthEvent::SignedOut);
        }
        Err(e) => {
            warn!(error = %e, "token refresh failed; will retry on next session read");
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for GoTrueClient {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        let current = self.shared.session.borrow().clone();
        let Some(session) = current else {
            return Ok(None);
        };
        if !session.expires_within(now_unix(), 0) {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.clone().filter(|t| !t.is_empty()) else {
            install(&self.shared, None, AuthEvent::SignedOut);
            return Ok(None);
        };
        match self.shared.refresh(&refresh_token).await {
            Ok(fresh) => {
                install(&self.shared, Some(fresh.clone()), AuthEvent::TokenRefreshed);
                Ok(Some(fresh))
            }
            Err(ProviderError::Rejected { status, message }) => {
                warn!(status, %message, "expired session could not be refreshed");
                install(&self.shared, None, AuthEvent::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.shared.changes.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError> {
        let body = json!({ "email": email, "password": password });
        let text = self
            .shared
            .post("/token", &[("grant_type", "password")], &body, None)
            .await?;
        let session = parse_session(&text, now_unix())?;
        info!(user_id = %session.user_id, "provider issued session");
        install(&self.shared, Some(session.clone()), AuthEvent::SignedIn);
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, ProviderError> {
        let body = json!({
            "email": request.email.trim(),
            "password": request.password,
            "data": request.metadata(),
        });
        let text = self.shared.post("/signup", &[], &body, None).await?;
        let response = parse_sign_up(&text, now_unix())?;
        if let Some(session) = &response.session {
            install(&self.shared, Some(session.clone()), AuthEvent::SignedIn);
        }
        Ok(response)
    }

    async fn reset_password_for_email(&self, email: &str, redirect_to: Option<&str>) -> Result<(), ProviderError> {
        let body = json!({ "email": email });
        let query: Vec<(&str, &str)> = redirect_to.map(|r| ("redirect_to", r)).into_iter().collect();
        self.shared.post("/recover", &query, &body, None).await?;
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let token = self
            .shared
            .session
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone());
        let result = match token {
            Some(token) => self
                .shared
                .post("/logout", &[], &json!({}), Some(&token))
                .await
                .map(drop),
            None => Ok(()),
        };
        // The local session ends even when the server call fails.
        install(&self.shared, None, AuthEvent::SignedOut);
        result
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    user: WireUser,
}

#[derive(Deserialize)]
struct WireUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    identities: Option<Vec<Value>>,
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse a token-grant response into a [`Session`].
pub(crate) fn parse_session(text: &str, now: i64) -> Result<Session, ProviderError> {
    let token: TokenResponse = serde_json::from_str(text).map_err(|e| ProviderError::Decode(e.to_string()))?;
    Ok(session_from_token(token, now))
}

fn session_from_token(token: TokenResponse, now: i64) -> Session {
    let expires_at = token
        .expires_at
        .unwrap_or_else(|| now.saturating_add(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)));
    Session {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        token_type: token.token_type.unwrap_or_else(|| "bearer".into()),
        expires_at,
        user_id: token.user.id,
        email: token.user.email,
    }
}

/// Parse a `/signup` response. With auto-confirm the provider returns a full
/// token grant; otherwise a bare user. A user with an empty `identities`
/// list is the provider's obfuscated answer for an already-registered email.
pub(crate) fn parse_sign_up(text: &str, now: i64) -> Result<SignUpResponse, ProviderError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProviderError::Decode(e.to_string()))?;

    if value.get("access_token").is_some() {
        let token: TokenResponse = serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let session = session_from_token(token, now);
        return Ok(SignUpResponse { user_id: Some(session.user_id), session: Some(session) });
    }

    let user_value = match value.get("user") {
        Some(user) if user.is_object() => user.clone(),
        _ => value,
    };
    let user: WireUser = serde_json::from_value(user_value).map_err(|e| ProviderError::Decode(e.to_string()))?;
    if user.identities.as_ref().is_some_and(Vec::is_empty) {
        return Err(ProviderError::Rejected { status: 422, message: DUPLICATE_ACCOUNT_MESSAGE.into() });
    }
    Ok(SignUpResponse { user_id: Some(user.id), session: None })
}

/// Human-readable message from an error body. Understands the provider's
/// `msg`, OAuth-style `error_description`, and generic `message`/`error`
/// shapes; falls back to the raw body or the status.
pub(crate) fn parse_error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let found = ["msg", "error_description", "message", "error"]
            .iter()
            .filter_map(|key| value.get(key).and_then(Value::as_str))
            .find(|s| !s.trim().is_empty());
        if let Some(message) = found {
            return message.to_owned();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.len() > 200 || trimmed.starts_with('{') {
        format!("request failed with status {status}")
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
#[path = "gotrue_test.rs"]
mod tests;
