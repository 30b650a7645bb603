//! Client configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Two values are required (`SUPABASE_URL`, `SUPABASE_ANON_KEY`); every
//! tuning knob has a `DEFAULT_*` constant and falls back to it when unset or
//! unparseable. `from_lookup` takes the variable source as a function so
//! tests never touch the process environment.

use std::fmt;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::session::profile::RetryPolicy;

pub const DEFAULT_HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROFILE_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_PROFILE_RETRY_BASE_MS: u64 = 250;
pub const DEFAULT_PROFILE_RETRY_MAX_MS: u64 = 4000;
pub const DEFAULT_SESSION_REFRESH_MARGIN_SECS: u64 = 60;
pub const DEFAULT_REALTIME_HEARTBEAT_SECS: u64 = 25;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    Missing { var: &'static str },

    #[error("config parse failed: {0}")]
    Parse(String),
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "E_CONFIG_MISSING",
            Self::Parse(_) => "E_CONFIG_PARSE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_HTTP_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_HTTP_CONNECT_TIMEOUT_SECS }
    }
}

impl HttpTimeouts {
    /// Build the shared `reqwest` client used by the HTTP adapters.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn http_client(self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_secs))
            .connect_timeout(Duration::from_secs(self.connect_secs))
            .build()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClinicConfig {
    /// Project base URL, without a trailing slash.
    pub supabase_url: String,
    pub anon_key: String,
    /// Where password-reset emails send the user back to.
    pub password_reset_redirect: Option<String>,
    pub timeouts: HttpTimeouts,
    pub profile_retry: RetryPolicy,
    pub refresh_margin_secs: u64,
    pub realtime_heartbeat_secs: u64,
}

impl ClinicConfig {
    /// Config with every optional knob at its default.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not http(s) or the key is blank.
    pub fn new(supabase_url: &str, anon_key: &str) -> Result<Self, ConfigError> {
        let supabase_url = normalize_url(supabase_url)?;
        let anon_key = anon_key.trim();
        if anon_key.is_empty() {
            return Err(ConfigError::Parse("SUPABASE_ANON_KEY is empty".into()));
        }

        Ok(Self {
            supabase_url,
            anon_key: anon_key.to_owned(),
            password_reset_redirect: None,
            timeouts: HttpTimeouts::default(),
            profile_retry: RetryPolicy::default(),
            refresh_margin_secs: DEFAULT_SESSION_REFRESH_MARGIN_SECS,
            realtime_heartbeat_secs: DEFAULT_REALTIME_HEARTBEAT_SECS,
        })
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `SUPABASE_URL`
    /// - `SUPABASE_ANON_KEY`
    ///
    /// Optional:
    /// - `PASSWORD_RESET_REDIRECT_URL`
    /// - `HTTP_REQUEST_TIMEOUT_SECS`: default 30
    /// - `HTTP_CONNECT_TIMEOUT_SECS`: default 10
    /// - `PROFILE_RETRY_ATTEMPTS`: default 5
    /// - `PROFILE_RETRY_BASE_MS`: default 250
    /// - `PROFILE_RETRY_MAX_MS`: default 4000
    /// - `SESSION_REFRESH_MARGIN_SECS`: default 60
    /// - `REALTIME_HEARTBEAT_SECS`: default 25
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClinicConfig::from_env`] with an explicit variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("SUPABASE_URL").ok_or(ConfigError::Missing { var: "SUPABASE_URL" })?;
        let key = lookup("SUPABASE_ANON_KEY").ok_or(ConfigError::Missing { var: "SUPABASE_ANON_KEY" })?;
        let mut config = Self::new(&url, &key)?;

        config.password_reset_redirect = lookup("PASSWORD_RESET_REDIRECT_URL")
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty());
        config.timeouts = HttpTimeouts {
            request_secs: lookup_parse(&lookup, "HTTP_REQUEST_TIMEOUT_SECS", DEFAULT_HTTP_REQUEST_TIMEOUT_SECS),
            connect_secs: lookup_parse(&lookup, "HTTP_CONNECT_TIMEOUT_SECS", DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
        };
        config.profile_retry = RetryPolicy {
            attempts: lookup_parse(&lookup, "PROFILE_RETRY_ATTEMPTS", DEFAULT_PROFILE_RETRY_ATTEMPTS).max(1),
            base_delay: Duration::from_millis(lookup_parse(&lookup, "PROFILE_RETRY_BASE_MS", DEFAULT_PROFILE_RETRY_BASE_MS)),
            max_delay: Duration::from_millis(lookup_parse(&lookup, "PROFILE_RETRY_MAX_MS", DEFAULT_PROFILE_RETRY_MAX_MS)),
        };
        config.refresh_margin_secs =
            lookup_parse(&lookup, "SESSION_REFRESH_MARGIN_SECS", DEFAULT_SESSION_REFRESH_MARGIN_SECS);
        config.realtime_heartbeat_secs =
            lookup_parse(&lookup, "REALTIME_HEARTBEAT_SECS", DEFAULT_REALTIME_HEARTBEAT_SECS).max(1);

        Ok(config)
    }

    #[must_use]
    pub fn auth_url(&self) -> String {
        format!("{}/auth/v1", self.supabase_url)
    }

    #[must_use]
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.supabase_url)
    }
}

impl fmt::Debug for ClinicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClinicConfig")
            .field("supabase_url", &self.supabase_url)
            .field("anon_key", &"<redacted>")
            .field("password_reset_redirect", &self.password_reset_redirect)
            .field("timeouts", &self.timeouts)
            .field("profile_retry", &self.profile_retry)
            .field("refresh_margin_secs", &self.refresh_margin_secs)
            .field("realtime_heartbeat_secs", &self.realtime_heartbeat_secs)
            .finish()
    }
}

fn normalize_url(raw: &str) -> Result<String, ConfigError> {
    let url = raw.trim().trim_end_matches('/');
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ConfigError::Parse(format!("SUPABASE_URL must be an http(s) URL, got '{url}'")));
    }
    Ok(url.to_owned())
}

fn lookup_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
