//! Storage adapter contract plus an in-memory reference implementation.
//!
//! A host supplies one [`StorageAdapter`] impl backing every connector
//! record; the core never sees a raw connection, only this trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// The persisted row. Uniqueness: `(scope, identity, provider)`.
#[derive(Debug, Clone)]
pub struct ConnectorRecord {
    pub id: String,
    pub scope: String,
    pub identity: String,
    pub provider: String,
    pub value: HashMap<String, Value>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted by [`StorageAdapter::save`]. `id`/timestamps are assigned
/// by the adapter.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct NewConnectorRecord {
    pub scope: String,
    pub identity: String,
    pub provider: String,
    pub value: HashMap<String, Value>,
    #[builder(default = "true")]
    pub enabled: bool,
}

/// A partial update, per field. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRecordUpdate {
    pub value: Option<HashMap<String, Value>>,
    pub enabled: Option<bool>,
}

/// `value.webhook` metadata updated after every webhook delivery attempt.
#[derive(Debug, Clone)]
pub struct WebhookMetadataUpdate {
    pub last_event_at: DateTime<Utc>,
    pub last_event_result: WebhookEventResult,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventResult {
    Success,
    Error,
}

impl WebhookEventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventResult::Success => "success",
            WebhookEventResult::Error => "error",
        }
    }
}

/// The storage contract every host must supply. Every method is a suspension
/// point; implementations are expected to honor cancellation and treat each
/// call as a single fallible, independent future.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, scope: &str, identity: &str, provider: &str) -> Result<Option<ConnectorRecord>>;

    /// Every connector installed for a `(scope, identity)` bucket, across
    /// providers.
    async fn list(&self, scope: &str, identity: &str) -> Result<Vec<ConnectorRecord>>;

    /// Upsert keyed on `(scope, identity, provider)`: a repeat save for an
    /// already-connected provider updates `value`/`enabled` in place rather
    /// than failing, and returns the resulting record with refreshed
    /// timestamps.
    async fn save(&self, record: NewConnectorRecord) -> Result<ConnectorRecord>;

    async fn update(
        &self,
        scope: &str,
        identity: &str,
        provider: &str,
        patch: ConnectorRecordUpdate,
    ) -> Result<ConnectorRecord>;

    async fn delete(&self, scope: &str, identity: &str, provider: &str) -> Result<()>;

    async fn exists(&self, scope: &str, identity: &str, provider: &str) -> Result<bool>;

    async fn count_connections(&self, provider: &str) -> Result<u64>;

    async fn find_by_webhook_secret(&self, provider: &str, secret: &str) -> Result<Option<ConnectorRecord>>;

    async fn update_webhook_metadata(
        &self,
        scope: &str,
        identity: &str,
        provider: &str,
        update: WebhookMetadataUpdate,
    ) -> Result<()>;
}

/// An in-memory [`StorageAdapter`], useful for tests and single-process
/// deployments that don't need durability across restarts.
#[derive(Default)]
pub struct InMemoryAdapter {
    records: RwLock<HashMap<(String, String, String), ConnectorRecord>>,
}

impl InMemoryAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(scope: &str, identity: &str, provider: &str) -> (String, String, String) {
        (scope.to_string(), identity.to_string(), provider.to_string())
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    async fn get(&self, scope: &str, identity: &str, provider: &str) -> Result<Option<ConnectorRecord>> {
        Ok(self.records.read().await.get(&Self::key(scope, identity, provider)).cloned())
    }

    async fn list(&self, scope: &str, identity: &str) -> Result<Vec<ConnectorRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<ConnectorRecord> =
            records.values().filter(|r| r.scope == scope && r.identity == identity).cloned().collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched)
    }

    async fn save(&self, record: NewConnectorRecord) -> Result<ConnectorRecord> {
        let key = Self::key(&record.scope, &record.identity, &record.provider);
        let now = Utc::now();
        let mut records = self.records.write().await;
        let created_at = records.get(&key).map(|existing| existing.created_at).unwrap_or(now);
        let stored = ConnectorRecord {
            id: records.get(&key).map(|existing| existing.id.clone()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            scope: record.scope,
            identity: record.identity,
            provider: record.provider,
            value: record.value,
            enabled: record.enabled,
            created_at,
            updated_at: now,
        };
        records.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        scope: &str,
        identity: &str,
        provider: &str,
        patch: ConnectorRecordUpdate,
    ) -> Result<ConnectorRecord> {
        let key = Self::key(scope, identity, provider);
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key)
            .ok_or_else(|| Error::ConnectorNotConnected { connector: provider.to_string() })?;

        if let Some(value) = patch.value {
            record.value = value;
        }
        if let Some(enabled) = patch.enabled {
            record.enabled = enabled;
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, scope: &str, identity: &str, provider: &str) -> Result<()> {
        self.records.write().await.remove(&Self::key(scope, identity, provider));
        Ok(())
    }

    async fn exists(&self, scope: &str, identity: &str, provider: &str) -> Result<bool> {
        Ok(self.records.read().await.contains_key(&Self::key(scope, identity, provider)))
    }

    async fn count_connections(&self, provider: &str) -> Result<u64> {
        Ok(self.records.read().await.values().filter(|r| r.provider == provider).count() as u64)
    }

    async fn find_by_webhook_secret(&self, provider: &str, secret: &str) -> Result<Option<ConnectorRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| {
                r.provider == provider
                    && r.value.get("webhook").and_then(|w| w.get("secret")).and_then(Value::as_str) == Some(secret)
            })
            .cloned())
    }

    async fn update_webhook_metadata(
        &self,
        scope: &str,
        identity: &str,
        provider: &str,
        update: WebhookMetadataUpdate,
    ) -> Result<()> {
        let key = Self::key(scope, identity, provider);
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key)
            .ok_or_else(|| Error::ConnectorNotConnected { connector: provider.to_string() })?;

        let mut webhook = record.value.get("webhook").cloned().unwrap_or_else(|| serde_json::json!({}));
        webhook["lastEventAt"] = serde_json::json!(update.last_event_at.to_rfc3339());
        webhook["lastEventResult"] = serde_json::json!(update.last_event_result.as_str());
        if let Some(error) = update.error {
            webhook["error"] = serde_json::json!(error);
        }
        record.value.insert("webhook".to_string(), webhook);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scope: &str, identity: &str, provider: &str) -> NewConnectorRecord {
        NewConnectorRecordBuilder::default()
            .scope(scope.to_string())
            .identity(identity.to_string())
            .provider(provider.to_string())
            .value(HashMap::new())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let adapter = InMemoryAdapter::new();
        adapter.save(record("org", "org_1", "slack")).await.unwrap();
        let fetched = adapter.get("org", "org_1", "slack").await.unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().provider, "slack");
    }

    #[tokio::test]
    async fn repeat_save_upserts_in_place() {
        let adapter = InMemoryAdapter::new();
        let first = adapter.save(record("org", "org_1", "slack")).await.unwrap();

        let mut second = record("org", "org_1", "slack");
        second.value.insert("apiKey".to_string(), serde_json::json!("new-key"));
        second.enabled = false;
        let updated = adapter.save(second).await.unwrap();

        assert_eq!(updated.id, first.id);
        assert_eq!(updated.created_at, first.created_at);
        assert!(updated.updated_at >= first.updated_at);
        assert_eq!(updated.value.get("apiKey").unwrap(), "new-key");
        assert!(!updated.enabled);

        let records = adapter.list("org", "org_1").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn update_missing_record_fails() {
        let adapter = InMemoryAdapter::new();
        let result = adapter.update("org", "org_1", "slack", ConnectorRecordUpdate::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn webhook_secret_lookup() {
        let adapter = InMemoryAdapter::new();
        let mut value = HashMap::new();
        value.insert("webhook".to_string(), serde_json::json!({"secret": "abc123"}));
        let mut new_record = record("org", "org_1", "stripe");
        new_record.value = value;
        adapter.save(new_record).await.unwrap();

        let found = adapter.find_by_webhook_secret("stripe", "abc123").await.unwrap();
        assert!(found.is_some());
        let not_found = adapter.find_by_webhook_secret("stripe", "wrong").await.unwrap();
        assert!(not_found.is_none());
    }

    #[tokio::test]
    async fn list_returns_every_provider_for_a_scope_identity() {
        let adapter = InMemoryAdapter::new();
        adapter.save(record("org", "org_1", "slack")).await.unwrap();
        adapter.save(record("org", "org_1", "mailchimp")).await.unwrap();
        adapter.save(record("org", "org_2", "slack")).await.unwrap();

        let records = adapter.list("org", "org_1").await.unwrap();
        assert_eq!(records.len(), 2);
        let providers: Vec<&str> = records.iter().map(|r| r.provider.as_str()).collect();
        assert!(providers.contains(&"slack"));
        assert!(providers.contains(&"mailchimp"));
    }

    #[tokio::test]
    async fn count_connections_scopes_by_provider() {
        let adapter = InMemoryAdapter::new();
        adapter.save(record("org", "org_1", "slack")).await.unwrap();
        adapter.save(record("org", "org_2", "slack")).await.unwrap();
        adapter.save(record("org", "org_1", "mailchimp")).await.unwrap();
        assert_eq!(adapter.count_connections("slack").await.unwrap(), 2);
        assert_eq!(adapter.count_connections("mailchimp").await.unwrap(), 1);
    }
}
