//! Session manager: the single writer of [`AuthState`].
//!
//! ARCHITECTURE
//! ============
//! `SessionManager::start` subscribes to provider notifications and then
//! spawns one driver task. The driver owns everything that can change
//! state: the notification receiver, a `JoinSet` of in-flight session and
//! profile lookups, and the `watch` sender that publishes snapshots.
//! Notifications and lookup completions are serialized through one
//! `tokio::select!`, so no lock guards the state.
//!
//! ```text
//!   provider ──SessionChange──► driver ──spawn──► current_session / fetch_profile
//!                                  ▲                        │
//!                                  └───── Resolution ◄──────┘
//!                                  │
//!                                  └──watch──► AuthState snapshots
//! ```
//!
//! GENERATIONS
//! ===========
//! Every notification, and the initial session request, takes the next
//! value of a monotonic counter. Lookups carry the generation they were
//! started for; a completion whose generation is no longer current is
//! dropped. The newest notification always wins, whatever order the
//! lookups finish in.
//!
//! ERROR HANDLING
//! ==============
//! Lookup failures never escape the driver. A failed session request on
//! cold start is treated as "no session"; a failed re-read keeps whatever
//! session was already published. A failed profile lookup leaves the
//! session in place with `user = None`. A lookup task that panics settles its
//! generation the same way, so `loading` never sticks. Only the four
//! operations return errors, as [`AuthFailure`].
//!
//! TRADE-OFFS
//! ==========
//! Superseded lookups are not aborted; they run to completion and are
//! discarded. Their retry loops stop early once they notice they are stale.

pub mod profile;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::ClinicConfig;
use crate::error::{AuthFailure, ErrorCode};
use crate::identity::{IdentityProvider, ProviderError, SessionChange};
use crate::model::{AuthState, Session, SignUpRequest, UserProfile};
use crate::store::RowStore;
use profile::{ProfileError, RetryPolicy, fetch_profile_with_retry};

const SHUT_DOWN_MESSAGE: &str = "session manager is shut down";

/// Tunables for [`SessionManager::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub profile_retry: RetryPolicy,
    /// Where password-reset emails send the user back to.
    pub password_reset_redirect: Option<String>,
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &ClinicConfig) -> Self {
        Self {
            profile_retry: config.profile_retry,
            password_reset_redirect: config.password_reset_redirect.clone(),
        }
    }
}

// =============================================================================
// SHARED
// =============================================================================

/// State visible to both the handle and the driver.
struct Shared {
    alive: AtomicBool,
    generation: AtomicU64,
    state: watch::Sender<AuthState>,
    stopped: Notify,
}

impl Shared {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Replace the published snapshot. No-op after shutdown.
    fn publish(&self, next: AuthState) {
        if !self.is_alive() {
            return;
        }
        debug_assert!(next.is_consistent(), "inconsistent auth state: {next:?}");
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Owns the authentication lifecycle. Create once with [`SessionManager::start`]
/// and share by `Arc`; dropping it (or calling [`SessionManager::shutdown`])
/// stops all background work.
pub struct SessionManager {
    identity: Arc<dyn IdentityProvider>,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    options: SessionOptions,
}

impl SessionManager {
    /// Subscribe to provider notifications and start the driver task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(identity: Arc<dyn IdentityProvider>, store: Arc<dyn RowStore>, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(AuthState::initializing());
        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            state,
            stopped: Notify::new(),
        });

        // Subscribe before the driver issues its first session request so
        // no notification can fall between the two.
        let changes = identity.subscribe();
        let driver = Driver {
            identity: identity.clone(),
            store,
            changes,
            shared: shared.clone(),
            tasks: JoinSet::new(),
            pending: HashMap::new(),
            retry: options.profile_retry,
        };
        let handle = tokio::spawn(driver.run());

        Self { identity, shared, driver: Mutex::new(Some(handle)), options }
    }

    /// The latest published state.
    #[must_use]
    pub fn snapshot(&self) -> AuthState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every published state from now on.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.shared.state.subscribe()
    }

    /// Wait until `loading` is false and return that state. Returns the
    /// current snapshot immediately once the manager is shut down.
    pub async fn settled(&self) -> AuthState {
        let mut rx = self.shared.state.subscribe();
        let stopped = self.shared.stopped.notified();
        if !self.shared.is_alive() {
            return self.snapshot();
        }
        tokio::select! {
            result = rx.wait_for(|state| !state.loading) => match result {
                Ok(state) => state.clone(),
                Err(_) => self.snapshot(),
            },
            () = stopped => self.snapshot(),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_alive()
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Sign in with email and password. On success the new state arrives
    /// through the provider's notification, not from this call.
    ///
    /// # Errors
    ///
    /// The provider's message when it refuses the credentials or cannot be
    /// reached. Published state is unchanged.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), AuthFailure> {
        self.ensure_running()?;
        match self.identity.sign_in_with_password(email, password).await {
            Ok(session) => {
                info!(user_id = %session.user_id, "sign-in accepted");
                Ok(())
            }
            Err(e) => Err(operation_failed("sign-in", e)),
        }
    }

    /// Register a new account. The profile row is created server-side; if
    /// the provider signs the account in immediately, the profile lookup
    /// retries until that row exists.
    ///
    /// # Errors
    ///
    /// The provider's message, e.g. "User already registered".
    pub async fn sign_up(&self, request: SignUpRequest) -> Result<(), AuthFailure> {
        self.ensure_running()?;
        match self.identity.sign_up(&request).await {
            Ok(response) => {
                info!(
                    user_id = ?response.user_id,
                    role = %request.effective_role(),
                    signed_in = response.session.is_some(),
                    "account registered"
                );
                Ok(())
            }
            Err(e) => Err(operation_failed("sign-up", e)),
        }
    }

    /// Ask the provider to email a password-reset link.
    ///
    /// # Errors
    ///
    /// The provider's message when the request is refused or fails.
    pub async fn reset_password_for_email(&self, email: &str) -> Result<(), AuthFailure> {
        self.ensure_running()?;
        let redirect = self.options.password_reset_redirect.as_deref();
        match self.identity.reset_password_for_email(email, redirect).await {
            Ok(()) => {
                info!(redirect = ?redirect, "password reset requested");
                Ok(())
            }
            Err(e) => Err(operation_failed("password reset", e)),
        }
    }

    /// Sign out. Failures are logged; the state change arrives through the
    /// provider's notification.
    pub async fn sign_out(&self) {
        if !self.shared.is_alive() {
            debug!("sign-out ignored: {SHUT_DOWN_MESSAGE}");
            return;
        }
        if let Err(e) = self.identity.sign_out().await {
            warn!(error = %e, code = e.error_code(), "sign-out failed");
        }
    }

    /// Stop the driver, abort in-flight lookups, and drop the provider
    /// subscription. No state is published afterwards. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            driver.abort();
        }
        self.shared.stopped.notify_waiters();
        info!("session manager shut down");
    }

    fn ensure_running(&self) -> Result<(), AuthFailure> {
        if self.shared.is_alive() { Ok(()) } else { Err(AuthFailure::new(SHUT_DOWN_MESSAGE)) }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn operation_failed(operation: &str, err: ProviderError) -> AuthFailure {
    warn!(error = %err, code = err.error_code(), operation, "auth operation failed");
    err.into()
}

// =============================================================================
// DRIVER
// =============================================================================

/// Completion of a lookup task, tagged with its generation.
enum Resolution {
    Session { generation: u64, result: Result<Option<Session>, ProviderError> },
    Profile { generation: u64, session: Session, result: Result<UserProfile, ProfileError> },
}

/// What a task was started for, so a panicked task can still be settled.
struct Pending {
    generation: u64,
    session: Option<Session>,
}

struct Driver {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn RowStore>,
    changes: broadcast::Receiver<SessionChange>,
    shared: Arc<Shared>,
    tasks: JoinSet<Resolution>,
    pending: HashMap<Id, Pending>,
    retry: RetryPolicy,
}

impl Driver {
    async fn run(mut self) {
        let generation = self.shared.next_generation();
        self.request_session(generation);

        let mut changes_open = true;
        loop {
            tokio::select! {
                change = self.changes.recv(), if changes_open => match change {
                    Ok(change) => self.on_change(change),
                    Err(RecvError::Lagged(skipped)) => {
                        let generation = self.shared.next_generation();
                        warn!(skipped, generation, "session notifications dropped; re-reading current session");
                        self.request_session(generation);
                    }
                    Err(RecvError::Closed) => {
                        info!("identity provider closed its notification channel");
                        changes_open = false;
                    }
                },
                Some(joined) = self.tasks.join_next_with_id() => self.on_joined(joined),
                else => break,
            }
        }
        debug!("session driver exiting");
    }

    fn on_change(&mut self, change: SessionChange) {
        let generation = self.shared.next_generation();
        info!(
            event = ?change.event,
            generation,
            user_id = ?change.session.as_ref().map(Session::subject),
            "session change"
        );
        self.apply_session(generation, change.session);
    }

    /// Publish the branch for `session` and start its profile lookup.
    fn apply_session(&mut self, generation: u64, session: Option<Session>) {
        let Some(session) = session else {
            self.shared.publish(AuthState::unauthenticated());
            return;
        };

        // Same subject (token refresh): keep the loaded profile visible.
        let user = self
            .shared
            .state
            .borrow()
            .user
            .clone()
            .filter(|user| user.id == session.user_id);
        self.shared.publish(AuthState { session: Some(session.clone()), user, loading: true });
        self.fetch_profile(generation, session);
    }

    fn request_session(&mut self, generation: u64) {
        let identity = self.identity.clone();
        let handle = self.tasks.spawn(async move {
            let result = identity.current_session().await;
            Resolution::Session { generation, result }
        });
        self.pending.insert(handle.id(), Pending { generation, session: None });
    }

    fn fetch_profile(&mut self, generation: u64, session: Session) {
        let store = self.store.clone();
        let shared = self.shared.clone();
        let retry = self.retry;
        let tagged = session.clone();
        let handle = self.tasks.spawn(async move {
            let result =
                fetch_profile_with_retry(store.as_ref(), tagged.user_id, retry, || shared.is_current(generation)).await;
            Resolution::Profile { generation, session: tagged, result }
        });
        self.pending.insert(handle.id(), Pending { generation, session: Some(session) });
    }

    fn on_joined(&mut self, joined: Result<(Id, Resolution), JoinError>) {
        match joined {
            Ok((id, resolution)) => {
                self.pending.remove(&id);
                self.resolve(resolution);
            }
            Err(err) => {
                let Some(pending) = self.pending.remove(&err.id()) else {
                    return;
                };
                if err.is_cancelled() || !self.shared.is_current(pending.generation) {
                    return;
                }
                warn!(error = %err, generation = pending.generation, "session lookup task failed");
                let next = match pending.session {
                    Some(session) => AuthState { session: Some(session), user: None, loading: false },
                    None => self.last_known_or_signed_out(),
                };
                self.shared.publish(next);
            }
        }
    }

    /// State to publish when a session read fails. A re-read keeps the
    /// session already published; a cold start has none and signs out.
    fn last_known_or_signed_out(&self) -> AuthState {
        let current = self.shared.state.borrow();
        match &current.session {
            Some(session) => AuthState { session: Some(session.clone()), user: current.user.clone(), loading: false },
            None => AuthState::unauthenticated(),
        }
    }

    fn resolve(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Session { generation, result } => {
                if !self.shared.is_current(generation) {
                    debug!(generation, "discarding superseded session lookup");
                    return;
                }
                match result {
                    Ok(session) => self.apply_session(generation, session),
                    Err(e) => {
                        let next = self.last_known_or_signed_out();
                        warn!(
                            error = %e,
                            code = e.error_code(),
                            generation,
                            kept_session = next.session.is_some(),
                            "session lookup failed"
                        );
                        self.shared.publish(next);
                    }
                }
            }
            Resolution::Profile { generation, session, result } => {
                if !self.shared.is_current(generation) {
                    debug!(generation, user_id = %session.user_id, "discarding superseded profile lookup");
                    return;
                }
                match result {
                    Ok(user) => {
                        info!(generation, user_id = %user.id, role = %user.role, "profile loaded");
                        self.shared.publish(AuthState { session: Some(session), user: Some(user), loading: false });
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            code = e.error_code(),
                            generation,
                            user_id = %session.user_id,
                            "profile unavailable; continuing without user"
                        );
                        self.shared.publish(AuthState { session: Some(session), user: None, loading: false });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
