//! Role-scoped reads and writes over the clinic tables.
//!
//! DESIGN
//! ======
//! A loaded profile determines a [`Scope`]: parents see what is linked to
//! them, doctors see what is assigned to them, admins and staff see
//! everything. Each [`Resource`] maps that scope to an owning column:
//!
//! | resource         | parent U                        | doctor D                    |
//! |------------------|---------------------------------|-----------------------------|
//! | `babies`         | `id` in U's `baby_parents` rows | `assigned_doctor_id = D`    |
//! | `appointments`   | `parent_id = U`                 | `doctor_id = D`             |
//! | `messages`       | `recipient_id = U`              | `recipient_id = D`          |
//! | `growth_records` | `baby_id` in U's babies         | `baby_id` in D's babies     |
//!
//! The filter goes into the query, and every returned row is checked again
//! locally. Rows that fail the check are dropped and logged; the store's
//! row-level security stays the authority, this layer never widens it.
//! An empty association set returns no rows without querying. Counts are
//! computed by the store from the same filters, so only the query-side
//! scope applies to them.
//!
//! ERROR HANDLING
//! ==============
//! Store failures surface as `ScopeError::Store`. Writes validate their
//! input first and report `ScopeError::Invalid` without touching the store.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::model::{AuthState, Role, UserProfile};
use crate::store::{ChangeEvent, ChangeFeed, Direction, Filter, Query, Row, RowStore, StoreError};

pub const BABIES_TABLE: &str = "babies";
pub const BABY_PARENTS_TABLE: &str = "baby_parents";
pub const APPOINTMENTS_TABLE: &str = "appointments";
pub const MESSAGES_TABLE: &str = "messages";
pub const GROWTH_RECORDS_TABLE: &str = "growth_records";

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    #[error("no user profile is loaded")]
    NoProfile,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for ScopeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NoProfile => "E_NO_PROFILE",
            Self::Invalid(_) => "E_INVALID_REQUEST",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// SCOPE & RESOURCES
// =============================================================================

/// Authorization scope derived from a profile's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Parent(Uuid),
    Doctor(Uuid),
    Unrestricted,
}

impl Scope {
    #[must_use]
    pub fn for_profile(profile: &UserProfile) -> Self {
        match profile.role {
            Role::Parent => Self::Parent(profile.id),
            Role::Doctor => Self::Doctor(profile.id),
            Role::Admin | Role::Staff => Self::Unrestricted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Babies,
    Appointments,
    Messages,
    GrowthRecords,
}

impl Resource {
    pub const ALL: [Self; 4] = [Self::Babies, Self::Appointments, Self::Messages, Self::GrowthRecords];

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Babies => BABIES_TABLE,
            Self::Appointments => APPOINTMENTS_TABLE,
            Self::Messages => MESSAGES_TABLE,
            Self::GrowthRecords => GROWTH_RECORDS_TABLE,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// How a resource row is tied to the current user.
enum Ownership {
    /// The row's column holds the user id.
    Column(&'static str),
    /// The row's column holds a baby id that must be among the user's babies.
    LinkedBabies(&'static str),
}

fn ownership(resource: Resource, scope: Scope) -> Option<Ownership> {
    match (scope, resource) {
        (Scope::Unrestricted, _) => None,
        (_, Resource::Messages) => Some(Ownership::Column("recipient_id")),
        (_, Resource::GrowthRecords) => Some(Ownership::LinkedBabies("baby_id")),
        (Scope::Parent(_), Resource::Babies) => Some(Ownership::LinkedBabies("id")),
        (Scope::Parent(_), Resource::Appointments) => Some(Ownership::Column("parent_id")),
        (Scope::Doctor(_), Resource::Babies) => Some(Ownership::Column("assigned_doctor_id")),
        (Scope::Doctor(_), Resource::Appointments) => Some(Ownership::Column("doctor_id")),
    }
}

/// The scope filter for one read.
enum Resolved {
    All,
    Filter(Filter),
    /// The user has no associated babies; nothing can match.
    Empty,
}

// =============================================================================
// OPTIONS & RESULTS
// =============================================================================

/// Shape of a list read. The scope filter is always added on top.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl ListOptions {
    #[must_use]
    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((column.into(), direction));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Per-resource counts for the dashboard screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardCounts {
    pub babies: usize,
    pub appointments: usize,
    pub messages: usize,
    pub growth_records: usize,
}

// =============================================================================
// QUERIES
// =============================================================================

/// Reads and writes on behalf of one loaded profile.
#[derive(Clone)]
pub struct ScopedQueries {
    store: Arc<dyn RowStore>,
    profile: UserProfile,
    scope: Scope,
}

impl ScopedQueries {
    #[must_use]
    pub fn new(store: Arc<dyn RowStore>, profile: UserProfile) -> Self {
        let scope = Scope::for_profile(&profile);
        Self { store, profile, scope }
    }

    /// Build from a published state.
    ///
    /// # Errors
    ///
    /// `NoProfile` when the state carries no loaded user.
    pub fn for_state(store: Arc<dyn RowStore>, state: &AuthState) -> Result<Self, ScopeError> {
        let profile = state.user.clone().ok_or(ScopeError::NoProfile)?;
        Ok(Self::new(store, profile))
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    #[must_use]
    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Rows of `resource` visible to the current user.
    ///
    /// # Errors
    ///
    /// `Store` when a lookup fails.
    pub async fn list(&self, resource: Resource, options: ListOptions) -> Result<Vec<Row>, ScopeError> {
        let Some((query, scope_filter)) = self.scoped_query(resource, options).await? else {
            debug!(%resource, user_id = %self.profile.id, "no linked babies; skipping read");
            return Ok(Vec::new());
        };

        let rows = self.store.select(&query).await?;
        Ok(self.retain_matching(resource, &query, scope_filter.as_ref(), rows))
    }

    /// Number of `resource` rows visible to the current user. The store
    /// counts server-side; no rows are transferred.
    ///
    /// # Errors
    ///
    /// As [`ScopedQueries::list`].
    pub async fn count(&self, resource: Resource) -> Result<usize, ScopeError> {
        let Some((query, _)) = self.scoped_query(resource, ListOptions::default()).await? else {
            return Ok(0);
        };
        Ok(self.store.count(&query).await?)
    }

    /// Counts for every resource.
    ///
    /// # Errors
    ///
    /// The first failing count.
    pub async fn dashboard(&self) -> Result<DashboardCounts, ScopeError> {
        Ok(DashboardCounts {
            babies: self.count(Resource::Babies).await?,
            appointments: self.count(Resource::Appointments).await?,
            messages: self.count(Resource::Messages).await?,
            growth_records: self.count(Resource::GrowthRecords).await?,
        })
    }

    /// Messages addressed to the current user, newest first.
    ///
    /// # Errors
    ///
    /// `Store` when the read fails.
    pub async fn inbox(&self) -> Result<Vec<Row>, ScopeError> {
        self.list(Resource::Messages, ListOptions::default().order_by("created_at", Direction::Descending))
            .await
    }

    /// # Errors
    ///
    /// `Store` when the read fails.
    pub async fn unread_count(&self) -> Result<usize, ScopeError> {
        let options = ListOptions::default().columns("id").filter(Filter::eq("read", false));
        Ok(self.list(Resource::Messages, options).await?.len())
    }

    /// Send a message from the current user.
    ///
    /// # Errors
    ///
    /// `Invalid` for a blank body, `Store` when the insert fails.
    pub async fn send_message(&self, recipient_id: Uuid, body: &str) -> Result<(), ScopeError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ScopeError::Invalid("message body is empty".into()));
        }

        let mut row = Row::new();
        row.insert("sender_id".into(), json!(self.profile.id.to_string()));
        row.insert("recipient_id".into(), json!(recipient_id.to_string()));
        row.insert("content".into(), json!(body));
        row.insert("read".into(), json!(false));
        self.store.insert(MESSAGES_TABLE, row).await?;

        debug!(sender_id = %self.profile.id, %recipient_id, "message sent");
        Ok(())
    }

    /// Mark one message read. Only messages addressed to the current user
    /// are touched, except for unrestricted roles.
    ///
    /// # Errors
    ///
    /// `Store` when the update fails.
    pub async fn mark_read(&self, message_id: Uuid) -> Result<(), ScopeError> {
        let mut filters = vec![Filter::eq("id", message_id.to_string())];
        if self.scope != Scope::Unrestricted {
            filters.push(Filter::eq("recipient_id", self.profile.id.to_string()));
        }

        let mut patch = Row::new();
        patch.insert("read".into(), Value::Bool(true));
        self.store.update(MESSAGES_TABLE, &filters, patch).await?;
        Ok(())
    }

    /// Live feed of inbox changes for the current user.
    ///
    /// # Errors
    ///
    /// `Store` when the subscription cannot be opened.
    pub async fn watch_inbox(&self) -> Result<InboxFeed, ScopeError> {
        let filter = match self.resolve(Resource::Messages).await? {
            Resolved::Filter(filter) => Some(filter),
            Resolved::All | Resolved::Empty => None,
        };
        let feed = self.store.subscribe(MESSAGES_TABLE, filter.clone()).await?;
        Ok(InboxFeed { feed, filter, user_id: self.profile.id })
    }

    // =========================================================================
    // SCOPE RESOLUTION
    // =========================================================================

    async fn resolve(&self, resource: Resource) -> Result<Resolved, ScopeError> {
        let user_id = self.profile.id.to_string();
        match ownership(resource, self.scope) {
            None => Ok(Resolved::All),
            Some(Ownership::Column(column)) => Ok(Resolved::Filter(Filter::eq(column, user_id))),
            Some(Ownership::LinkedBabies(column)) => {
                let ids = self.baby_ids().await?;
                if ids.is_empty() {
                    Ok(Resolved::Empty)
                } else {
                    Ok(Resolved::Filter(Filter::one_of(column, ids)))
                }
            }
        }
    }

    /// Ids of the babies linked to (parent) or assigned to (doctor) the user.
    async fn baby_ids(&self) -> Result<BTreeSet<String>, ScopeError> {
        let user_id = self.profile.id.to_string();
        let (table, owner, id_column) = match self.scope {
            Scope::Parent(_) => (BABY_PARENTS_TABLE, "parent_id", "baby_id"),
            Scope::Doctor(_) => (BABIES_TABLE, "assigned_doctor_id", "id"),
            Scope::Unrestricted => return Ok(BTreeSet::new()),
        };

        let owner_filter = Filter::eq(owner, user_id);
        let query = Query::from(table)
            .columns(format!("{id_column},{owner}"))
            .filter(owner_filter.clone());
        let rows = self.store.select(&query).await?;

        Ok(rows
            .iter()
            .filter(|row| owner_filter.matches(row))
            .filter_map(|row| row.get(id_column).and_then(Value::as_str).map(str::to_owned))
            .collect())
    }

    /// Build the read for `resource`: the scope filter first, then the
    /// caller's options. `None` when the scope can match nothing.
    async fn scoped_query(
        &self,
        resource: Resource,
        options: ListOptions,
    ) -> Result<Option<(Query, Option<Filter>)>, ScopeError> {
        let scope_filter = match self.resolve(resource).await? {
            Resolved::Empty => return Ok(None),
            Resolved::All => None,
            Resolved::Filter(filter) => Some(filter),
        };

        let mut query = Query::from(resource.table());
        if let Some(columns) = &options.columns {
            query = query.columns(match &scope_filter {
                Some(filter) => ensure_column(columns, filter.column()),
                None => columns.clone(),
            });
        }
        if let Some(filter) = &scope_filter {
            query = query.filter(filter.clone());
        }
        for filter in options.filters {
            query = query.filter(filter);
        }
        if let Some((column, direction)) = options.order {
            query = query.order_by(column, direction);
        }
        if let Some(limit) = options.limit {
            query = query.limit(limit);
        }
        Ok(Some((query, scope_filter)))
    }

    /// Drop rows the store should not have returned. The scope filter must
    /// match; its column is always selected. A caller filter is checked
    /// only when the row carries its column, since the select list may
    /// leave it out.
    fn retain_matching(&self, resource: Resource, query: &Query, scope: Option<&Filter>, rows: Vec<Row>) -> Vec<Row> {
        if query.filters.is_empty() {
            return rows;
        }
        let returned = rows.len();
        let kept: Vec<Row> = rows
            .into_iter()
            .filter(|row| scope.is_none_or(|filter| filter.matches(row)))
            .filter(|row| {
                query
                    .filters
                    .iter()
                    .filter(|filter| row.contains_key(filter.column()))
                    .all(|filter| filter.matches(row))
            })
            .collect();
        if kept.len() < returned {
            warn!(
                %resource,
                user_id = %self.profile.id,
                dropped = returned - kept.len(),
                "store returned rows outside the requested scope; dropped"
            );
        }
        kept
    }
}

/// Add `column` to a select list unless it is already covered.
pub(crate) fn ensure_column(columns: &str, column: &str) -> String {
    let items = split_top_level(columns);
    if items.iter().any(|item| *item == "*" || *item == column) {
        columns.to_owned()
    } else {
        format!("{columns},{column}")
    }
}

/// Split a select list on commas outside parentheses.
fn split_top_level(columns: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in columns.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(columns[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(columns[start..].trim());
    items
}

// =============================================================================
// INBOX FEED
// =============================================================================

/// Realtime inbox changes, re-checked against the user's scope.
pub struct InboxFeed {
    feed: ChangeFeed,
    filter: Option<Filter>,
    user_id: Uuid,
}

impl InboxFeed {
    /// Next in-scope change, or `None` once the feed closes.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            let event = self.feed.next().await?;
            let Some(filter) = &self.filter else {
                return Some(event);
            };
            if event.row().is_some_and(|row| filter.matches(row)) {
                return Some(event);
            }
            warn!(user_id = %self.user_id, kind = ?event.kind, "realtime change outside the user's scope; dropped");
        }
    }

    pub fn close(&mut self) {
        self.feed.close();
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
