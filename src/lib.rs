//! # clinic-session
//!
//! Session core for the clinic client: the authentication state machine that
//! publishes `{session, user, loading}` and the role-scoped query layer that
//! every screen reads through.
//!
//! ARCHITECTURE
//! ============
//! - `identity`: identity-provider boundary and the hosted `GoTrue` adapter.
//! - `store`: row-store boundary, the `PostgREST` adapter, and the realtime
//!   change feed.
//! - `session`: the `SessionManager` (single writer of `AuthState`) and
//!   profile resolution.
//! - `scope`: derives per-role filters and applies them to every read.
//!
//! Consumers hold an `Arc<SessionManager>` and receive immutable
//! `AuthState` snapshots; they never touch the identity provider except
//! through the manager's four operations.

pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod scope;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::ClinicConfig;
pub use error::{AuthFailure, ErrorCode};
pub use model::{AuthPhase, AuthState, Role, Session, SignUpRequest, UserProfile};
pub use scope::{Resource, Scope, ScopedQueries};
pub use session::{SessionManager, SessionOptions};
