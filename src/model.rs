//! Core data model: sessions, profiles, and the published auth state.
//!
//! DESIGN
//! ======
//! `Session` is opaque beyond its subject id, expiry, and refresh
//! capability. `UserProfile` mirrors the `profiles` table and is only ever
//! read by the client. `AuthState` is the immutable snapshot the session
//! manager publishes; its invariants are checked by [`AuthState::is_consistent`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ROLE
// =============================================================================

/// Application role stored on the profile row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Staff,
    #[default]
    Parent,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Staff => "staff",
            Self::Parent => "parent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "doctor" => Ok(Self::Doctor),
            "staff" => Ok(Self::Staff),
            "parent" => Ok(Self::Parent),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Token bundle issued by the identity provider. Lives only in memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Expiry as unix seconds.
    pub expires_at: i64,
    /// Subject id; the key of the matching `profiles` row.
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl Session {
    #[must_use]
    pub fn subject(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// `true` when the token expires within `margin_secs` of `now_unix`.
    #[must_use]
    pub fn expires_within(&self, now_unix: i64, margin_secs: i64) -> bool {
        self.expires_at.saturating_sub(margin_secs) <= now_unix
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Current time as unix seconds.
#[must_use]
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// =============================================================================
// USER PROFILE
// =============================================================================

/// Application-level user record. Mirrors the `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub first_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub last_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UserProfile {
    /// `"First Last"`, falling back to the email when both names are blank.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() { self.email.clone() } else { name.to_owned() }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// AUTH STATE
// =============================================================================

/// Derived lifecycle position of an [`AuthState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Startup: the provider has not answered yet.
    Initializing,
    /// A session is present and its profile is being resolved.
    ProfileLoading,
    Authenticated,
    /// A session is present but its profile could not be loaded.
    Degraded,
    Unauthenticated,
}

/// Snapshot published by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub session: Option<Session>,
    pub user: Option<UserProfile>,
    pub loading: bool,
}

impl AuthState {
    #[must_use]
    pub fn initializing() -> Self {
        Self { session: None, user: None, loading: true }
    }

    #[must_use]
    pub fn unauthenticated() -> Self {
        Self { session: None, user: None, loading: false }
    }

    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        match (&self.session, &self.user, self.loading) {
            (None, _, true) => AuthPhase::Initializing,
            (None, _, false) => AuthPhase::Unauthenticated,
            (Some(_), _, true) => AuthPhase::ProfileLoading,
            (Some(_), Some(_), false) => AuthPhase::Authenticated,
            (Some(_), None, false) => AuthPhase::Degraded,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some() && self.user.is_some()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.user.as_ref().map(|u| u.id)
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role)
    }

    /// `user` implies `session`, and a present user belongs to the session subject.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match (&self.session, &self.user) {
            (None, Some(_)) => false,
            (Some(session), Some(user)) => session.user_id == user.id,
            _ => true,
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::initializing()
    }
}

// =============================================================================
// SIGN-UP REQUEST
// =============================================================================

/// Account registration input. Profile fields travel as provider metadata and
/// are turned into a `profiles` row by a server-side trigger.
#[derive(Clone, PartialEq, Eq)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    /// Defaults to [`Role::Parent`] when absent.
    pub role: Option<Role>,
}

impl SignUpRequest {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            first_name: String::new(),
            last_name: String::new(),
            phone: None,
            role: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn effective_role(&self) -> Role {
        self.role.unwrap_or_default()
    }

    /// Metadata object sent alongside the credentials.
    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "first_name": self.first_name.trim(),
            "last_name": self.last_name.trim(),
            "phone": self.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()),
            "role": self.effective_role().as_str(),
        })
    }
}

impl fmt::Debug for SignUpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignUpRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("phone", &self.phone)
            .field("role", &self.effective_role())
            .finish()
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
