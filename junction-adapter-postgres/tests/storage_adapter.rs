//! Exercises [`PgConnectorStore`] against a live Postgres instance.
//!
//! Ignored by default: these need `DATABASE_URL` pointed at a throwaway
//! database, trading mocked `sqlx` for a real round trip. Run with:
//!
//! ```sh
//! DATABASE_URL=postgres://... cargo test -p junction-adapter-postgres -- --ignored
//! ```

use std::collections::HashMap;

use junction_adapter_postgres::PgConnectorStore;
use junction_core::storage::{ConnectorRecordUpdate, NewConnectorRecordBuilder, StorageAdapter};

async fn store() -> PgConnectorStore {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
    let store = PgConnectorStore::connect(&database_url).await.expect("connect");
    store.migrate().await.expect("migrate");
    sqlx::query("delete from connector_records").execute(store.pool()).await.expect("truncate");
    store
}

fn new_record(scope: &str, identity: &str, provider: &str) -> junction_core::storage::NewConnectorRecord {
    NewConnectorRecordBuilder::default()
        .scope(scope.to_string())
        .identity(identity.to_string())
        .provider(provider.to_string())
        .value(HashMap::new())
        .build()
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn save_then_get_round_trips() {
    let store = store().await;
    store.save(new_record("org", "org_1", "slack")).await.unwrap();
    let fetched = store.get("org", "org_1", "slack").await.unwrap();
    assert!(fetched.is_some());
    assert_eq!(fetched.unwrap().provider, "slack");
}

#[tokio::test]
#[ignore]
async fn repeat_save_upserts_in_place() {
    let store = store().await;
    let first = store.save(new_record("org", "org_1", "slack")).await.unwrap();

    let mut second = new_record("org", "org_1", "slack");
    second.value.insert("apiKey".to_string(), serde_json::json!("new-key"));
    second.enabled = false;
    let updated = store.save(second).await.unwrap();

    assert_eq!(updated.id, first.id);
    assert_eq!(updated.created_at, first.created_at);
    assert_eq!(updated.value.get("apiKey").unwrap(), "new-key");
    assert!(!updated.enabled);

    let records = store.list("org", "org_1").await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
#[ignore]
async fn update_missing_record_fails() {
    let store = store().await;
    let result = store.update("org", "org_1", "slack", ConnectorRecordUpdate::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
#[ignore]
async fn update_merges_value_and_enabled_independently() {
    let store = store().await;
    store.save(new_record("org", "org_1", "slack")).await.unwrap();

    let mut value = HashMap::new();
    value.insert("token".to_string(), serde_json::json!("abc"));
    let updated = store
        .update("org", "org_1", "slack", ConnectorRecordUpdate { value: Some(value), enabled: None })
        .await
        .unwrap();
    assert_eq!(updated.value.get("token").unwrap(), "abc");
    assert!(updated.enabled);

    let disabled = store
        .update("org", "org_1", "slack", ConnectorRecordUpdate { value: None, enabled: Some(false) })
        .await
        .unwrap();
    assert!(!disabled.enabled);
    assert_eq!(disabled.value.get("token").unwrap(), "abc");
}

#[tokio::test]
#[ignore]
async fn webhook_secret_lookup() {
    let store = store().await;
    let mut value = HashMap::new();
    value.insert("webhook".to_string(), serde_json::json!({"secret": "abc123"}));
    let mut record = new_record("org", "org_1", "stripe");
    record.value = value;
    store.save(record).await.unwrap();

    let found = store.find_by_webhook_secret("stripe", "abc123").await.unwrap();
    assert!(found.is_some());
    let not_found = store.find_by_webhook_secret("stripe", "wrong").await.unwrap();
    assert!(not_found.is_none());
}

#[tokio::test]
#[ignore]
async fn count_connections_scopes_by_provider() {
    let store = store().await;
    store.save(new_record("org", "org_1", "slack")).await.unwrap();
    store.save(new_record("org", "org_2", "slack")).await.unwrap();
    store.save(new_record("org", "org_1", "mailchimp")).await.unwrap();
    assert_eq!(store.count_connections("slack").await.unwrap(), 2);
    assert_eq!(store.count_connections("mailchimp").await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn list_returns_every_provider_for_a_scope_identity() {
    let store = store().await;
    store.save(new_record("org", "org_1", "slack")).await.unwrap();
    store.save(new_record("org", "org_1", "mailchimp")).await.unwrap();
    store.save(new_record("org", "org_2", "slack")).await.unwrap();

    let records = store.list("org", "org_1").await.unwrap();
    assert_eq!(records.len(), 2);
    let providers: Vec<&str> = records.iter().map(|r| r.provider.as_str()).collect();
    assert!(providers.contains(&"slack"));
    assert!(providers.contains(&"mailchimp"));
}

#[tokio::test]
#[ignore]
async fn delete_then_exists_is_false() {
    let store = store().await;
    store.save(new_record("org", "org_1", "slack")).await.unwrap();
    assert!(store.exists("org", "org_1", "slack").await.unwrap());
    store.delete("org", "org_1", "slack").await.unwrap();
    assert!(!store.exists("org", "org_1", "slack").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn update_webhook_metadata_merges_fields() {
    let store = store().await;
    store.save(new_record("org", "org_1", "stripe")).await.unwrap();

    store
        .update_webhook_metadata(
            "org",
            "org_1",
            "stripe",
            junction_core::storage::WebhookMetadataUpdate {
                last_event_at: chrono::Utc::now(),
                last_event_result: junction_core::storage::WebhookEventResult::Success,
                error: None,
            },
        )
        .await
        .unwrap();

    let record = store.get("org", "org_1", "stripe").await.unwrap().unwrap();
    let webhook = record.value.get("webhook").unwrap();
    assert_eq!(webhook["lastEventResult"], "success");
}
