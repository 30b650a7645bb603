use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;

use super::*;
use crate::model::Role;
use crate::test_helpers::{MemoryStore, profile_row, row};

fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy { attempts, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(4) }
}

// =========================================================================
// RetryPolicy
// =========================================================================

#[test]
fn delay_doubles_and_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_millis(250));
    assert_eq!(policy.delay_for(2), Duration::from_millis(500));
    assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(5), Duration::from_millis(4000));
    assert_eq!(policy.delay_for(40), Duration::from_millis(4000));
}

#[test]
fn default_policy_values() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.attempts, 5);
    assert_eq!(RetryPolicy::once().attempts, 1);
}

#[test]
fn only_not_found_is_retryable() {
    assert!(ProfileError::NotFound(Uuid::nil()).retryable());
    assert!(!ProfileError::Duplicate { user_id: Uuid::nil(), count: 2 }.retryable());
    assert!(!ProfileError::Malformed("x".into()).retryable());
    assert!(!ProfileError::Store(StoreError::Transport("down".into())).retryable());
    assert_eq!(ProfileError::Store(StoreError::Transport("down".into())).error_code(), "E_STORE_TRANSPORT");
}

// =========================================================================
// fetch_profile
// =========================================================================

#[tokio::test]
async fn fetch_returns_matching_row() {
    let store = MemoryStore::new();
    let id = Uuid::new_v4();
    store.seed(PROFILES_TABLE, [profile_row(id, Role::Doctor), profile_row(Uuid::new_v4(), Role::Parent)]);

    let profile = fetch_profile(&store, id).await.unwrap();
    assert_eq!(profile.id, id);
    assert_eq!(profile.role, Role::Doctor);

    let queries = store.queries(PROFILES_TABLE);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].filters, vec![Filter::eq("id", id.to_string())]);
}

#[tokio::test]
async fn fetch_missing_row_is_not_found() {
    let store = MemoryStore::new();
    let id = Uuid::new_v4();
    assert!(matches!(fetch_profile(&store, id).await, Err(ProfileError::NotFound(got)) if got == id));
}

#[tokio::test]
async fn fetch_duplicate_rows_is_error() {
    let store = MemoryStore::new();
    let id = Uuid::new_v4();
    store.seed(PROFILES_TABLE, [profile_row(id, Role::Parent), profile_row(id, Role::Parent)]);
    assert!(matches!(fetch_profile(&store, id).await, Err(ProfileError::Duplicate { count: 2, .. })));
}

#[tokio::test]
async fn fetch_malformed_row_is_error() {
    let store = MemoryStore::new();
    let id = Uuid::new_v4();
    store.seed(PROFILES_TABLE, [row(json!({ "id": id.to_string(), "role": "wizard" }))]);
    assert!(matches!(fetch_profile(&store, id).await, Err(ProfileError::Malformed(_))));
}

#[tokio::test]
async fn fetch_store_failure_propagates() {
    let store = MemoryStore::new();
    store.fail_next(PROFILES_TABLE, StoreError::Transport("connection reset".into()));
    assert!(matches!(fetch_profile(&store, Uuid::new_v4()).await, Err(ProfileError::Store(_))));
}

// =========================================================================
// fetch_profile_with_retry
// =========================================================================

#[tokio::test]
async fn retry_waits_for_provisioned_row() {
    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();

    let seeder = {
        let store = store.clone();
        tokio::spawn(async move {
            store.wait_for_queries(PROFILES_TABLE, 2).await;
            store.seed(PROFILES_TABLE, [profile_row(id, Role::Parent)]);
        })
    };

    let profile = fetch_profile_with_retry(store.as_ref(), id, fast_policy(10), || true).await.unwrap();
    seeder.await.unwrap();
    assert_eq!(profile.id, id);
    assert!(store.queries(PROFILES_TABLE).len() >= 2);
}

#[tokio::test]
async fn retry_gives_up_after_attempts() {
    let store = MemoryStore::new();
    let result = fetch_profile_with_retry(&store, Uuid::new_v4(), fast_policy(3), || true).await;
    assert!(matches!(result, Err(ProfileError::NotFound(_))));
    assert_eq!(store.queries(PROFILES_TABLE).len(), 3);
}

#[tokio::test]
async fn retry_stops_when_superseded() {
    let store = MemoryStore::new();
    let current = AtomicBool::new(true);
    let result = fetch_profile_with_retry(&store, Uuid::new_v4(), fast_policy(10), || {
        current.swap(false, Ordering::SeqCst)
    })
    .await;
    assert!(matches!(result, Err(ProfileError::NotFound(_))));
    assert_eq!(store.queries(PROFILES_TABLE).len(), 2);
}

#[tokio::test]
async fn network_errors_are_not_retried() {
    let store = MemoryStore::new();
    store.fail_next(PROFILES_TABLE, StoreError::Transport("down".into()));
    let result = fetch_profile_with_retry(&store, Uuid::new_v4(), fast_policy(5), || true).await;
    assert!(matches!(result, Err(ProfileError::Store(_))));
    assert_eq!(store.queries(PROFILES_TABLE).len(), 1);
}
