//! In-memory identity provider and row store for unit tests.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::identity::{AuthEvent, IdentityProvider, ProviderError, SESSION_CHANGE_CAPACITY, SessionChange, SignUpResponse};
use crate::model::{Role, Session, SignUpRequest, now_unix};
use crate::store::{ChangeEvent, ChangeFeed, ChangeKind, Direction, Filter, Query, Row, RowStore, StoreError};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

// =========================================================================
// Fixtures
// =========================================================================

/// A live session for `user_id` with an `access-<id>` token.
#[must_use]
pub fn session_for(user_id: Uuid) -> Session {
    Session {
        access_token: format!("access-{user_id}"),
        refresh_token: Some(format!("refresh-{user_id}")),
        token_type: "bearer".into(),
        expires_at: now_unix() + 3600,
        user_id,
        email: Some(format!("{user_id}@clinic.test")),
    }
}

/// A well-formed `profiles` row.
#[must_use]
pub fn profile_row(id: Uuid, role: Role) -> Row {
    row(json!({
        "id": id.to_string(),
        "email": format!("{id}@clinic.test"),
        "role": role.as_str(),
        "first_name": "Test",
        "last_name": role.as_str(),
        "phone": null,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
    }))
}

/// Unwrap a JSON object literal into a `Row`.
#[must_use]
pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row fixture must be a JSON object")
}

// =========================================================================
// MemoryIdentity
// =========================================================================

struct Account {
    password: String,
    user_id: Uuid,
}

#[derive(Default)]
struct IdentityInner {
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    current_gate: Option<oneshot::Receiver<()>>,
    current_failure: Option<ProviderError>,
    sign_out_failure: Option<ProviderError>,
    auto_confirm: bool,
    sign_ups: Vec<SignUpRequest>,
    resets: Vec<(String, Option<String>)>,
}

pub struct MemoryIdentity {
    inner: Mutex<IdentityInner>,
    changes: broadcast::Sender<SessionChange>,
}

impl MemoryIdentity {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(SESSION_CHANGE_CAPACITY);
        Self { inner: Mutex::new(IdentityInner::default()), changes }
    }

    /// Register an account and return its subject id.
    pub fn add_account(&self, email: &str, password: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        self.inner
            .lock()
            .unwrap()
            .accounts
            .insert(email.to_owned(), Account { password: password.to_owned(), user_id });
        user_id
    }

    /// Set the held session without notifying subscribers.
    pub fn set_session(&self, session: Option<Session>) {
        self.inner.lock().unwrap().session = session;
    }

    /// Make the next `current_session` call wait until the sender fires.
    pub fn gate_current_session(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().current_gate = Some(rx);
        tx
    }

    pub fn fail_current_session(&self, err: ProviderError) {
        self.inner.lock().unwrap().current_failure = Some(err);
    }

    pub fn fail_sign_out(&self, err: ProviderError) {
        self.inner.lock().unwrap().sign_out_failure = Some(err);
    }

    /// Sign new accounts in immediately on sign-up.
    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.inner.lock().unwrap().auto_confirm = auto_confirm;
    }

    /// Replace the held session and broadcast the change.
    pub fn emit(&self, event: AuthEvent, session: Option<Session>) {
        self.inner.lock().unwrap().session.clone_from(&session);
        let _ = self.changes.send(SessionChange { event, session });
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.changes.receiver_count()
    }

    #[must_use]
    pub fn sign_ups(&self) -> Vec<SignUpRequest> {
        self.inner.lock().unwrap().sign_ups.clone()
    }

    #[must_use]
    pub fn resets(&self) -> Vec<(String, Option<String>)> {
        self.inner.lock().unwrap().resets.clone()
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        let gate = self.inner.lock().unwrap().current_gate.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.current_failure.take() {
            return Err(err);
        }
        Ok(inner.session.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError> {
        let user_id = {
            let inner = self.inner.lock().unwrap();
            match inner.accounts.get(email) {
                Some(account) if account.password == password => account.user_id,
                _ => {
                    return Err(ProviderError::Rejected { status: 400, message: "Invalid login credentials".into() });
                }
            }
        };
        let session = session_for(user_id);
        self.emit(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, ProviderError> {
        let (user_id, auto_confirm) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.accounts.contains_key(&request.email) {
                return Err(ProviderError::Rejected { status: 422, message: "User already registered".into() });
            }
            let user_id = Uuid::new_v4();
            inner
                .accounts
                .insert(request.email.clone(), Account { password: request.password.clone(), user_id });
            inner.sign_ups.push(request.clone());
            (user_id, inner.auto_confirm)
        };

        let session = auto_confirm.then(|| session_for(user_id));
        if session.is_some() {
            self.emit(AuthEvent::SignedIn, session.clone());
        }
        Ok(SignUpResponse { user_id: Some(user_id), session })
    }

    async fn reset_password_for_email(&self, email: &str, redirect_to: Option<&str>) -> Result<(), ProviderError> {
        self.inner
            .lock()
            .unwrap()
            .resets
            .push((email.to_owned(), redirect_to.map(str::to_owned)));
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        if let Some(err) = self.inner.lock().unwrap().sign_out_failure.take() {
            return Err(err);
        }
        self.emit(AuthEvent::SignedOut, None);
        Ok(())
    }
}

// =========================================================================
// MemoryStore
// =========================================================================

#[derive(Default)]
struct StoreInner {
    tables: HashMap<String, Vec<Row>>,
    gates: HashMap<String, VecDeque<oneshot::Receiver<()>>>,
    failures: HashMap<String, VecDeque<StoreError>>,
    queries: Vec<Query>,
    feeds: Vec<(String, Option<Filter>, mpsc::Sender<ChangeEvent>)>,
    project: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    queried: Notify,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        self.inner
            .lock()
            .unwrap()
            .tables
            .entry(table.to_owned())
            .or_default()
            .extend(rows);
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner.lock().unwrap().tables.get(table).cloned().unwrap_or_default()
    }

    /// Return only the selected columns, as `PostgREST` does. Off by
    /// default: every select returns whole rows.
    pub fn project_columns(&self) {
        self.inner.lock().unwrap().project = true;
    }

    /// Hold the next `select` on `table` until the returned sender fires
    /// (or is dropped). Gates queue up in call order.
    pub fn gate(&self, table: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .gates
            .entry(table.to_owned())
            .or_default()
            .push_back(rx);
        tx
    }

    /// Fail the next `select` on `table` with `err`.
    pub fn fail_next(&self, table: &str, err: StoreError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(table.to_owned())
            .or_default()
            .push_back(err);
    }

    /// Every query issued against `table`, in order.
    #[must_use]
    pub fn queries(&self, table: &str) -> Vec<Query> {
        self.inner
            .lock()
            .unwrap()
            .queries
            .iter()
            .filter(|q| q.table == table)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn query_count(&self) -> usize {
        self.inner.lock().unwrap().queries.len()
    }

    /// Wait until at least `count` queries have hit `table`.
    pub async fn wait_for_queries(&self, table: &str, count: usize) {
        let wait = async {
            loop {
                let notified = self.queried.notified();
                if self.queries(table).len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_LIMIT, wait)
            .await
            .expect("timed out waiting for store queries");
    }

    fn publish(&self, table: &str, kind: ChangeKind, record: &Row) {
        let inner = self.inner.lock().unwrap();
        for (feed_table, filter, tx) in &inner.feeds {
            if feed_table == table && filter.as_ref().is_none_or(|f| f.matches(record)) {
                let _ = tx.try_send(ChangeEvent {
                    table: table.to_owned(),
                    kind,
                    record: Some(record.clone()),
                    old_record: None,
                });
            }
        }
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait::async_trait]
impl RowStore for MemoryStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner.queries.push(query.clone());
            inner.gates.get_mut(&query.table).and_then(VecDeque::pop_front)
        };
        self.queried.notify_waiters();

        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.failures.get_mut(&query.table).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let mut rows: Vec<Row> = inner
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if inner.project && query.columns.trim() != "*" {
            let columns: Vec<&str> = query.columns.split(',').map(str::trim).collect();
            for row in &mut rows {
                row.retain(|key, _| columns.contains(&key.as_str()));
            }
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .entry(table.to_owned())
            .or_default()
            .push(row.clone());
        self.publish(table, ChangeKind::Insert, &row);
        Ok(())
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<(), StoreError> {
        let updated: Vec<Row> = {
            let mut inner = self.inner.lock().unwrap();
            let rows = inner.tables.entry(table.to_owned()).or_default();
            rows.iter_mut()
                .filter(|r| filters.iter().all(|f| f.matches(r)))
                .map(|r| {
                    r.extend(patch.clone());
                    r.clone()
                })
                .collect()
        };
        for row in &updated {
            self.publish(table, ChangeKind::Update, row);
        }
        Ok(())
    }

    async fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<ChangeFeed, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().unwrap().feeds.push((table.to_owned(), filter, tx));
        Ok(ChangeFeed::new(rx, None))
    }
}
