//! Error vocabulary shared by the adapters and the session core.
//!
//! DESIGN
//! ======
//! Each boundary owns a `thiserror` enum (`ProviderError`, `StoreError`,
//! `ProfileError`, `ScopeError`, `ConfigError`). All of them implement
//! [`ErrorCode`] so log lines carry a grepable code and a retryable flag.
//! Callers of the session operations never see those enums: they get an
//! [`AuthFailure`] holding a message fit for display.

/// Grepable error code and retryable flag for structured log fields.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Failure returned by `sign_in`, `sign_up` and `reset_password_for_email`.
///
/// Carries the provider's own wording (e.g. `"Invalid login credentials"`)
/// when the provider rejected the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AuthFailure {
    pub message: String,
}

impl AuthFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
