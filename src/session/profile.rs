//! Profile lookup keyed by the session subject.
//!
//! DESIGN
//! ======
//! Exactly one `profiles` row must match the subject id. Zero rows, several
//! rows, or a row that does not decode are all reported as distinct
//! [`ProfileError`]s so the caller can log them precisely; the session
//! manager treats every one of them as "no profile".
//!
//! A freshly registered account has its profile row created by a server-side
//! trigger, so the first lookup after sign-up can race it. Only `NotFound`
//! is retried, with capped exponential back-off, and the loop gives up early
//! as soon as the caller reports the lookup is no longer current.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::model::UserProfile;
use crate::store::{Filter, Query, RowStore, StoreError};

pub const PROFILES_TABLE: &str = "profiles";

const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 250;
const DEFAULT_RETRY_MAX_MS: u64 = 4000;

/// Bounded exponential back-off for profile lookups that find no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total lookups, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// A single lookup, no retries.
    #[must_use]
    pub fn once() -> Self {
        Self { attempts: 1, ..Self::default() }
    }

    /// Sleep before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift).min(self.max_delay)
    }
}

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProfileError {
    #[error("no profile row for user {0}")]
    NotFound(Uuid),

    #[error("{count} profile rows for user {user_id}")]
    Duplicate { user_id: Uuid, count: usize },

    #[error("malformed profile row: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for ProfileError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_PROFILE_NOT_FOUND",
            Self::Duplicate { .. } => "E_PROFILE_DUPLICATE",
            Self::Malformed(_) => "E_PROFILE_MALFORMED",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// =============================================================================
// LOOKUP
// =============================================================================

/// Fetch the single profile row whose id is `user_id`.
///
/// # Errors
///
/// `NotFound`/`Duplicate` when the row count is not exactly one, `Malformed`
/// when the row does not decode, `Store` when the request itself fails.
pub async fn fetch_profile(store: &dyn RowStore, user_id: Uuid) -> Result<UserProfile, ProfileError> {
    let query = Query::from(PROFILES_TABLE).filter(Filter::eq("id", user_id.to_string()));
    let mut rows = store.select(&query).await?;

    match rows.len() {
        0 => Err(ProfileError::NotFound(user_id)),
        1 => {
            let row = rows.remove(0);
            let profile: UserProfile =
                serde_json::from_value(Value::Object(row)).map_err(|e| ProfileError::Malformed(e.to_string()))?;
            if profile.id == user_id {
                Ok(profile)
            } else {
                Err(ProfileError::Malformed(format!("row id {} does not match subject", profile.id)))
            }
        }
        count => Err(ProfileError::Duplicate { user_id, count }),
    }
}

/// [`fetch_profile`] with back-off on `NotFound`.
///
/// `is_current` is polled before every retry; once it returns `false` the
/// last error is returned without another lookup.
///
/// # Errors
///
/// The error of the final attempt.
pub async fn fetch_profile_with_retry(
    store: &dyn RowStore,
    user_id: Uuid,
    policy: RetryPolicy,
    is_current: impl Fn() -> bool + Send + Sync,
) -> Result<UserProfile, ProfileError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match fetch_profile(store, user_id).await {
            Ok(profile) => return Ok(profile),
            Err(e) if e.retryable() && attempt < attempts => {
                let delay = policy.delay_for(attempt);
                debug!(%user_id, attempt, total = attempts, delay_ms = delay.as_millis() as u64, "profile not found yet; retrying");
                tokio::time::sleep(delay).await;
                if !is_current() {
                    debug!(%user_id, attempt, "profile lookup superseded; abandoning retries");
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => {
                if e.retryable() {
                    warn!(%user_id, attempts, "profile still missing after retries");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;
