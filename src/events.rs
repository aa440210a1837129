//! The event union and its fan-out.
//!
//! `Event` is a discriminated variant with a shared base (`connector`,
//! `scope`, `identity`, `timestamp`); a single central [`EventBus::emit`]
//! routes every event to both the in-process subscriber list and the
//! telemetry sink, so there is exactly one string-typed `match` in the crate
//! (inside `Event::name`) instead of one per emission site.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::Code;

/// Shared attributes every event carries.
#[derive(Debug, Clone, Serialize)]
pub struct EventBase {
    pub connector: String,
    pub scope: String,
    pub identity: String,
    pub timestamp: DateTime<Utc>,
}

/// The tagged event union. Every variant embeds an [`EventBase`] plus
/// whatever extra attributes that event carries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "connector.connected")]
    ConnectorConnected(EventBase),
    #[serde(rename = "connector.disconnected")]
    ConnectorDisconnected(EventBase),
    #[serde(rename = "connector.enabled")]
    ConnectorEnabled(EventBase),
    #[serde(rename = "connector.disabled")]
    ConnectorDisabled(EventBase),
    #[serde(rename = "connector.updated")]
    ConnectorUpdated(EventBase),

    #[serde(rename = "oauth.started")]
    OAuthStarted(EventBase),
    #[serde(rename = "oauth.completed")]
    OAuthCompleted(EventBase),
    #[serde(rename = "oauth.refreshed")]
    OAuthRefreshed(EventBase),
    #[serde(rename = "oauth.failed")]
    OAuthFailed { base: EventBase, error_code: Code, error_message: Option<String> },

    #[serde(rename = "action.started")]
    ActionStarted { base: EventBase, action: String },
    #[serde(rename = "action.completed")]
    ActionCompleted { base: EventBase, action: String, duration_ms: u64 },
    #[serde(rename = "action.failed")]
    ActionFailed {
        base: EventBase,
        action: String,
        duration_ms: u64,
        error_code: Code,
        error_message: Option<String>,
    },

    #[serde(rename = "webhook.received")]
    WebhookReceived {
        base: EventBase,
        method: Option<String>,
        path: Option<String>,
        verified: Option<bool>,
    },
    #[serde(rename = "webhook.processed")]
    WebhookProcessed { base: EventBase, duration_ms: Option<u64> },
    #[serde(rename = "webhook.failed")]
    WebhookFailed {
        base: EventBase,
        duration_ms: Option<u64>,
        error_code: Code,
        error_message: Option<String>,
    },

    #[serde(rename = "error.occurred")]
    ErrorOccurred { base: EventBase, error_code: Code, error_message: Option<String>, operation: Option<String> },
}

/// Telemetry level, passed alongside the event name to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Event {
    /// `igniter.connectors.<eventType>`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectorConnected(_) => "igniter.connectors.connector.connected",
            Event::ConnectorDisconnected(_) => "igniter.connectors.connector.disconnected",
            Event::ConnectorEnabled(_) => "igniter.connectors.connector.enabled",
            Event::ConnectorDisabled(_) => "igniter.connectors.connector.disabled",
            Event::ConnectorUpdated(_) => "igniter.connectors.connector.updated",
            Event::OAuthStarted(_) => "igniter.connectors.oauth.started",
            Event::OAuthCompleted(_) => "igniter.connectors.oauth.completed",
            Event::OAuthRefreshed(_) => "igniter.connectors.oauth.refreshed",
            Event::OAuthFailed { .. } => "igniter.connectors.oauth.failed",
            Event::ActionStarted { .. } => "igniter.connectors.action.started",
            Event::ActionCompleted { .. } => "igniter.connectors.action.completed",
            Event::ActionFailed { .. } => "igniter.connectors.action.failed",
            Event::WebhookReceived { .. } => "igniter.connectors.webhook.received",
            Event::WebhookProcessed { .. } => "igniter.connectors.webhook.processed",
            Event::WebhookFailed { .. } => "igniter.connectors.webhook.failed",
            Event::ErrorOccurred { .. } => "igniter.connectors.error.occurred",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Event::OAuthFailed { .. } | Event::ActionFailed { .. } | Event::WebhookFailed { .. } | Event::ErrorOccurred { .. } => {
                Level::Error
            }
            Event::ConnectorConnected(_)
            | Event::ConnectorDisconnected(_)
            | Event::ConnectorEnabled(_)
            | Event::ConnectorDisabled(_)
            | Event::ConnectorUpdated(_)
            | Event::OAuthStarted(_)
            | Event::OAuthCompleted(_)
            | Event::OAuthRefreshed(_)
            | Event::ActionCompleted { .. }
            | Event::WebhookProcessed { .. } => Level::Info,
            Event::ActionStarted { .. } | Event::WebhookReceived { .. } => Level::Debug,
        }
    }
}

/// Host-supplied telemetry sink. Optional: [`EventBus`] works fine
/// with no sink configured, emitting only to in-process subscribers.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn emit(&self, event_name: &str, attributes: serde_json::Value, level: Level);
}

/// The zero-configuration default sink: re-emits every event as a
/// `tracing::event!` at the level the event carries. Always a working
/// default, never a hard dependency a host must wire up first.
pub struct TracingTelemetrySink;

#[async_trait]
impl TelemetrySink for TracingTelemetrySink {
    async fn emit(&self, event_name: &str, attributes: serde_json::Value, level: Level) {
        match level {
            Level::Debug => tracing::debug!(event = event_name, %attributes),
            Level::Info => tracing::info!(event = event_name, %attributes),
            Level::Warn => tracing::warn!(event = event_name, %attributes),
            Level::Error => tracing::error!(event = event_name, %attributes),
        }
    }
}

/// An in-process event subscriber. Failures are logged and swallowed: one
/// subscriber's error must never prevent later subscribers in the same
/// `emit` from running, and must never propagate to the caller of the
/// operation that triggered the event.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Fan-out to subscribers plus the telemetry sink. Subscribers are
/// thread-safe to add/remove at any time, unlike the registry's other maps,
/// which are immutable once built.
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl EventBus {
    pub fn new(sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        Self { subscribers: RwLock::new(Vec::new()), sink }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Remove every currently-registered subscriber with the given pointer
    /// identity. Used by hosts that want to deregister a subscriber they
    /// hold an `Arc` to.
    pub async fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        let target = Arc::as_ptr(subscriber) as *const ();
        self.subscribers.write().await.retain(|s| Arc::as_ptr(s) as *const () != target);
    }

    /// Emit `event` to every subscriber (serially, fault-isolated) and then
    /// to the telemetry sink, if configured.
    pub async fn emit(&self, event: Event) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            if let Err(err) = subscriber.on_event(&event).await {
                tracing::warn!(error = %err, event = event.name(), "event subscriber failed; continuing");
            }
        }
        drop(subscribers);

        if let Some(sink) = &self.sink {
            let attributes = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
            sink.emit(event.name(), attributes, event.level()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSubscriber {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Subscriber for CountingSubscriber {
        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn base() -> EventBase {
        EventBase { connector: "slack".into(), scope: "org".into(), identity: "org_1".into(), timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn fault_isolation_across_subscribers() {
        let bus = EventBus::new(None);
        let failing_count = Arc::new(AtomicUsize::new(0));
        let healthy_count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(CountingSubscriber { count: failing_count.clone(), fail: true })).await;
        bus.subscribe(Arc::new(CountingSubscriber { count: healthy_count.clone(), fail: false })).await;

        bus.emit(Event::ConnectorConnected(base())).await;

        assert_eq!(failing_count.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_count.load(Ordering::SeqCst), 1);

        // A second emission proves the failing subscriber wasn't dropped
        // and the healthy one keeps receiving events.
        bus.emit(Event::ConnectorConnected(base())).await;
        assert_eq!(failing_count.load(Ordering::SeqCst), 2);
        assert_eq!(healthy_count.load(Ordering::SeqCst), 2);
    }
}
