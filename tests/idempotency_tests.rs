use chrono::{DateTime, Utc};
use retryq::{Error, IdempotencyManager, IdempotencyStore, MemoryIdempotencyStore};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time;

/// Memory store that yields after every read, so concurrent callers interleave
/// between looking a key up and registering it
#[derive(Default)]
struct InterleavingStore {
    inner: MemoryIdempotencyStore,
}

#[async_trait::async_trait]
impl IdempotencyStore for InterleavingStore {
    async fn get(&self, key: &str) -> retryq::Result<Option<String>> {
        let value = self.inner.get(key).await;
        tokio::task::yield_now().await;
        value
    }

    async fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> retryq::Result<()> {
        self.inner.set(key, value, expires_at).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expires_at: DateTime<Utc>,
    ) -> retryq::Result<bool> {
        self.inner.set_if_absent(key, value, expires_at).await
    }

    async fn delete(&self, key: &str) -> retryq::Result<()> {
        self.inner.delete(key).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> retryq::Result<usize> {
        self.inner.purge_expired(now).await
    }
}

fn setup_manager() -> IdempotencyManager {
    IdempotencyManager::in_memory(Duration::from_secs(3600))
}

#[tokio::test]
async fn test_cached_response_is_replayed() {
    let manager = setup_manager();
    let request = json!({"project_id": "p-1", "title": "Pilot"});

    assert!(manager
        .check_idempotency("save-p-1", &request)
        .await
        .unwrap()
        .is_none());

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    let stored = manager
        .store_response("save-p-1", 201, json!({"id": "p-1"}), headers, None)
        .await
        .unwrap();

    let first = manager
        .check_idempotency("save-p-1", &request)
        .await
        .unwrap()
        .unwrap();
    let second = manager
        .check_idempotency("save-p-1", &request)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first, stored);
    assert_eq!(second, stored);
    assert_eq!(first.status_code, 201);
    assert_eq!(first.response_data, json!({"id": "p-1"}));
    assert_eq!(first.headers["content-type"], "application/json");
}

#[tokio::test]
async fn test_key_reuse_with_different_request_conflicts() {
    let manager = setup_manager();

    manager
        .check_idempotency("save-ep-3", &json!({"episode": 3, "text": "draft"}))
        .await
        .unwrap();

    let result = manager
        .check_idempotency("save-ep-3", &json!({"episode": 3, "text": "final"}))
        .await;

    match result {
        Err(Error::Conflict { key }) => assert_eq!(key, "save-ep-3"),
        other => panic!("Expected a conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_conflict_does_not_overwrite_cached_response() {
    let manager = setup_manager();
    let original = json!({"amount": 10});

    manager.check_idempotency("k-1", &original).await.unwrap();
    manager
        .store_response("k-1", 200, json!({"ok": true}), BTreeMap::new(), None)
        .await
        .unwrap();

    assert!(manager
        .check_idempotency("k-1", &json!({"amount": 99}))
        .await
        .is_err());

    let replay = manager.check_idempotency("k-1", &original).await.unwrap();
    assert_eq!(replay.unwrap().response_data, json!({"ok": true}));
}

#[tokio::test]
async fn test_matching_key_without_response_lets_caller_proceed() {
    let manager = setup_manager();
    let request = json!({"b": 2, "a": 1});

    assert!(manager.check_idempotency("k-2", &request).await.unwrap().is_none());
    // Same body with keys in another order is the same request
    assert!(manager
        .check_idempotency("k-2", &json!({"a": 1, "b": 2}))
        .await
        .unwrap()
        .is_none());

    let record = manager.get_key("k-2").await.unwrap().unwrap();
    assert_eq!(record.request_hash, retryq::request_hash(&request));
}

#[tokio::test]
async fn test_create_key() {
    let manager = setup_manager();
    let request = json!({"generation_id": "g-5"});

    let key = manager
        .create_key(
            Some("save_generation"),
            &request,
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(key.operation.as_deref(), Some("save_generation"));
    assert_eq!((key.expires_at - key.created_at).num_seconds(), 60);
    assert!(uuid::Uuid::parse_str(&key.key).is_ok());

    assert!(manager
        .check_idempotency(&key.key, &request)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        manager
            .check_idempotency(&key.key, &json!({"generation_id": "g-6"}))
            .await,
        Err(Error::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_store_response_requires_known_key() {
    let manager = setup_manager();

    let result = manager
        .store_response("never-checked", 200, json!(null), BTreeMap::new(), None)
        .await;

    assert!(matches!(result, Err(Error::UnknownIdempotencyKey(_))));
}

#[tokio::test]
async fn test_invalid_keys_are_rejected() {
    let manager = setup_manager();

    for key in ["", "white space", "tab\tkey"] {
        let result = manager.check_idempotency(key, &json!({})).await;
        assert!(
            matches!(result, Err(Error::InvalidIdempotencyKey(_))),
            "key {:?} should be rejected",
            key
        );
    }
}

#[tokio::test]
async fn test_expired_entries_are_forgotten_and_purged() {
    let manager = IdempotencyManager::in_memory(Duration::from_millis(100));

    manager
        .check_idempotency("short-lived", &json!({"v": 1}))
        .await
        .unwrap();
    manager
        .store_response("short-lived", 200, json!({}), BTreeMap::new(), None)
        .await
        .unwrap();

    time::sleep(Duration::from_millis(200)).await;

    // Key and cached response both expired
    assert_eq!(manager.cleanup_expired().await.unwrap(), 2);

    // An expired key no longer binds its old request
    assert!(manager
        .check_idempotency("short-lived", &json!({"v": 2}))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_memory_store_hides_expired_values() {
    let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
    let now = chrono::Utc::now();

    store
        .set("live", "1".to_string(), now + chrono::Duration::seconds(60))
        .await
        .unwrap();
    store
        .set("stale", "2".to_string(), now - chrono::Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(store.get("live").await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.get("stale").await.unwrap(), None);
    assert_eq!(store.purge_expired(chrono::Utc::now()).await.unwrap(), 1);

    store.delete("live").await.unwrap();
    assert_eq!(store.get("live").await.unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_first_uses_with_different_requests_conflict() {
    let manager = IdempotencyManager::new(
        Arc::new(InterleavingStore::default()),
        Duration::from_secs(3600),
    );
    let small = json!({"amount": 1});
    let large = json!({"amount": 999});

    let (first, second) = tokio::join!(
        manager.check_idempotency("pay-1", &small),
        manager.check_idempotency("pay-1", &large),
    );

    let allowed = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Ok(None)))
        .count();
    let conflicts = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(Error::Conflict { .. })))
        .count();
    assert_eq!(allowed, 1, "got {:?} and {:?}", first, second);
    assert_eq!(conflicts, 1);

    // The winner's request stays bound to the key
    let record = manager.get_key("pay-1").await.unwrap().unwrap();
    let winner = if first.is_ok() { &small } else { &large };
    assert_eq!(record.request_hash, retryq::request_hash(winner));
}

#[tokio::test]
async fn test_concurrent_first_uses_with_same_request_both_proceed() {
    let manager = IdempotencyManager::new(
        Arc::new(InterleavingStore::default()),
        Duration::from_secs(3600),
    );
    let request = json!({"amount": 5});

    let (first, second) = tokio::join!(
        manager.check_idempotency("pay-2", &request),
        manager.check_idempotency("pay-2", &request),
    );
    assert!(first.unwrap().is_none());
    assert!(second.unwrap().is_none());
}

#[tokio::test]
async fn test_first_stored_response_wins() {
    let manager = setup_manager();
    let request = json!({"episode": 4});

    manager.check_idempotency("save-ep-4", &request).await.unwrap();
    let first = manager
        .store_response("save-ep-4", 201, json!({"id": "ep-4"}), BTreeMap::new(), None)
        .await
        .unwrap();
    let second = manager
        .store_response("save-ep-4", 500, json!({"error": "late"}), BTreeMap::new(), None)
        .await
        .unwrap();

    assert_eq!(second, first);
    let replay = manager
        .check_idempotency("save-ep-4", &request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay.status_code, 201);
    assert_eq!(replay.response_data, json!({"id": "ep-4"}));
}

#[tokio::test]
async fn test_set_if_absent_respects_live_values() {
    let store = MemoryIdempotencyStore::new();
    let now = Utc::now();

    assert!(store
        .set_if_absent("k", "first".to_string(), now + chrono::Duration::seconds(60))
        .await
        .unwrap());
    assert!(!store
        .set_if_absent("k", "second".to_string(), now + chrono::Duration::seconds(60))
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));

    // An expired value does not block a new one
    store
        .set("old", "stale".to_string(), now - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(store
        .set_if_absent("old", "fresh".to_string(), now + chrono::Duration::seconds(60))
        .await
        .unwrap());
    assert_eq!(store.get("old").await.unwrap().as_deref(), Some("fresh"));
}
