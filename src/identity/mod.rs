//! Identity-provider boundary.
//!
//! DESIGN
//! ======
//! The provider owns credentials and token lifecycle. It reports every
//! session transition (sign-in, sign-out, refresh, external invalidation)
//! as a [`SessionChange`] on a broadcast channel; the session manager is the
//! only component that listens and turns those into published state.

pub mod gotrue;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AuthFailure, ErrorCode};
use crate::model::{Session, SignUpRequest};

/// Buffered notifications per subscriber before it is considered lagging.
pub const SESSION_CHANGE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One provider notification: what happened and the session after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpResponse {
    pub user_id: Option<Uuid>,
    /// Present when the provider signs the new account in immediately.
    pub session: Option<Session>,
}

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the request (bad credentials, duplicate account,
    /// weak password, expired refresh token...).
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("identity request failed: {0}")]
    Transport(String),

    #[error("identity response parse failed: {0}")]
    Decode(String),

    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ErrorCode for ProviderError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "E_AUTH_REJECTED",
            Self::Transport(_) => "E_AUTH_TRANSPORT",
            Self::Decode(_) => "E_AUTH_DECODE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

impl From<ProviderError> for AuthFailure {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected { message, .. } => Self::new(message),
            other => Self::new(other.to_string()),
        }
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Remote identity provider.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The session the provider currently holds, refreshed if it had expired.
    async fn current_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Register for change notifications. Dropping the receiver unregisters.
    fn subscribe(&self) -> broadcast::Receiver<SessionChange>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError>;

    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, ProviderError>;

    async fn reset_password_for_email(&self, email: &str, redirect_to: Option<&str>) -> Result<(), ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;
}
