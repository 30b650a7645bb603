//! `clinic-session`: drive the session core against a hosted backend.
//!
//! Loads configuration, starts the session manager, optionally signs in,
//! prints the dashboard counts for the signed-in role, and follows the
//! inbox until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clinic_session::identity::IdentityProvider;
use clinic_session::identity::gotrue::GoTrueClient;
use clinic_session::scope::ScopeError;
use clinic_session::store::RowStore;
use clinic_session::store::postgrest::PostgrestStore;
use clinic_session::{AuthFailure, AuthPhase, AuthState, ClinicConfig, ScopedQueries, SessionManager, SessionOptions};
use tracing::{info, warn};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] clinic_session::config::ConfigError),
    #[error("identity client init failed: {0}")]
    Identity(#[from] clinic_session::identity::ProviderError),
    #[error("store client init failed: {0}")]
    Store(#[from] clinic_session::store::StoreError),
    #[error("sign-in failed: {0}")]
    SignIn(#[from] AuthFailure),
    #[error("query failed: {0}")]
    Query(#[from] ScopeError),
    #[error("--email and --password must be given together")]
    PartialCredentials,
    #[error("timed out waiting for the session to settle")]
    SettleTimeout,
}

#[derive(Parser, Debug)]
#[command(name = "clinic-session", about = "Clinic session and role-scoped data CLI")]
struct Cli {
    #[arg(long, env = "CLINIC_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "CLINIC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Sign out before exiting.
    #[arg(long)]
    sign_out_on_exit: bool,

    /// Print the dashboard and exit instead of following the inbox.
    #[arg(long)]
    no_inbox: bool,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = ClinicConfig::from_env()?;
    let identity = GoTrueClient::new(&config)?;
    let store: Arc<dyn RowStore> = Arc::new(PostgrestStore::new(&config, identity.session_watch())?);
    let identity: Arc<dyn IdentityProvider> = Arc::new(identity);

    let manager = Arc::new(SessionManager::start(identity, store.clone(), SessionOptions::from_config(&config)));
    let _observer = spawn_state_logger(&manager);

    let result = run(&cli, &manager, store).await;

    if cli.sign_out_on_exit {
        manager.sign_out().await;
    }
    manager.shutdown();
    result
}

async fn run(cli: &Cli, manager: &SessionManager, store: Arc<dyn RowStore>) -> Result<(), AppError> {
    let state = settle(manager).await?;

    match (&cli.email, &cli.password) {
        (Some(email), Some(password)) if !state.is_authenticated() => {
            manager.sign_in(email, password).await?;
            wait_for_session(manager).await?;
        }
        (Some(_), None) | (None, Some(_)) => return Err(AppError::PartialCredentials),
        _ => {}
    }

    let state = settle(manager).await?;
    let queries = match ScopedQueries::for_state(store, &state) {
        Ok(queries) => queries,
        Err(ScopeError::NoProfile) => {
            warn!(phase = ?state.phase(), "no user profile available; nothing to show");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let profile = queries.profile();
    info!(user = %profile.display_name(), role = %profile.role, "signed in");

    let counts = queries.dashboard().await?;
    let unread = queries.unread_count().await?;
    println!("babies: {}", counts.babies);
    println!("appointments: {}", counts.appointments);
    println!("messages: {} ({unread} unread)", counts.messages);
    println!("growth records: {}", counts.growth_records);

    if !cli.no_inbox {
        follow_inbox(&queries).await?;
    }
    Ok(())
}

async fn settle(manager: &SessionManager) -> Result<AuthState, AppError> {
    tokio::time::timeout(SETTLE_TIMEOUT, manager.settled())
        .await
        .map_err(|_| AppError::SettleTimeout)
}

/// After a sign-in, wait until the notification has produced a session and
/// its profile lookup has finished.
async fn wait_for_session(manager: &SessionManager) -> Result<(), AppError> {
    let mut rx = manager.subscribe();
    tokio::time::timeout(SETTLE_TIMEOUT, rx.wait_for(|s| s.session.is_some() && !s.loading))
        .await
        .map_err(|_| AppError::SettleTimeout)?
        .map_err(|_| AppError::SettleTimeout)?;
    Ok(())
}

async fn follow_inbox(queries: &ScopedQueries) -> Result<(), AppError> {
    let mut feed = queries.watch_inbox().await?;
    info!("following inbox; press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = feed.next() => {
                let Some(event) = event else {
                    warn!("inbox feed closed");
                    break;
                };
                let row = event.row().cloned().unwrap_or_default();
                let content = row.get("content").and_then(|v| v.as_str()).unwrap_or("");
                println!("[{:?}] {content}", event.kind);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    feed.close();
    Ok(())
}

fn spawn_state_logger(manager: &SessionManager) -> tokio::task::JoinHandle<()> {
    let mut rx = manager.subscribe();
    tokio::spawn(async move {
        loop {
            {
                let state = rx.borrow_and_update();
                log_state(&state);
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

fn log_state(state: &AuthState) {
    let user_id = state.session.as_ref().map(|s| s.user_id);
    match state.phase() {
        AuthPhase::Initializing => info!("auth: initializing"),
        AuthPhase::ProfileLoading => info!(?user_id, "auth: loading profile"),
        AuthPhase::Authenticated => info!(?user_id, role = ?state.role(), "auth: authenticated"),
        AuthPhase::Degraded => warn!(?user_id, "auth: signed in without a profile"),
        AuthPhase::Unauthenticated => info!("auth: signed out"),
    }
}
