//! End-to-end exercise of [`junction_core::TypedAction`] against a real
//! registry/manager pair, using the in-memory storage adapter so the whole
//! flow runs with no network and no database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use junction_core::registry::{ActionDefinitionBuilder, ActionHandler, ActionInput, ConnectorDefinitionSpecBuilder, ScopeDefinition};
use junction_core::{Crypto, InMemoryAdapter, Manager, Registry, TypedAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct SendMessage {
    channel: String,
    text: String,
}

#[derive(Deserialize, Debug, PartialEq)]
struct SendMessageResult {
    ok: bool,
    channel: String,
}

struct SendMessageHandler;

#[async_trait]
impl ActionHandler for SendMessageHandler {
    async fn call(&self, input: ActionInput) -> anyhow::Result<Value> {
        let channel = input.input.get("channel").and_then(Value::as_str).unwrap_or_default();
        Ok(serde_json::json!({ "ok": true, "channel": channel }))
    }
}

fn build_manager() -> Manager {
    let connector = ConnectorDefinitionSpecBuilder::default()
        .key("slack".to_string())
        .config_schema(serde_json::json!({"type": "object"}))
        .action(
            ActionDefinitionBuilder::default()
                .name("sendMessage".to_string())
                .input_schema(serde_json::json!({
                    "type": "object",
                    "required": ["channel", "text"],
                    "properties": {
                        "channel": {"type": "string"},
                        "text": {"type": "string"}
                    }
                }))
                .handler(Arc::new(SendMessageHandler) as Arc<dyn ActionHandler>)
                .build()
                .unwrap(),
        )
        .finish()
        .unwrap();

    let registry = Registry::builder()
        .storage(InMemoryAdapter::new())
        .crypto(Crypto::builtin("12345678901234567890123456789012").unwrap())
        .scope(ScopeDefinition::new("organization", true))
        .connector(connector)
        .build()
        .unwrap();

    Manager::new(registry)
}

#[tokio::test]
async fn typed_action_calls_handler_with_compile_time_types() {
    let manager = build_manager();
    let view = manager.scope("organization", Some("org_1")).unwrap();
    view.install("slack", HashMap::new(), None).await.unwrap();

    let send_message: TypedAction<SendMessage, SendMessageResult> = TypedAction::new("slack", "sendMessage");
    let caller = view.action("slack", "sendMessage");

    let outcome = send_message
        .call(&caller, SendMessage { channel: "#general".to_string(), text: "hello".to_string() })
        .await
        .unwrap();

    assert_eq!(outcome.data, Some(SendMessageResult { ok: true, channel: "#general".to_string() }));
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn typed_action_rejects_input_failing_schema_validation() {
    let manager = build_manager();
    let view = manager.scope("organization", Some("org_1")).unwrap();
    view.install("slack", HashMap::new(), None).await.unwrap();

    // `channel` omitted entirely: the action's input schema requires it, so
    // this fails validation before the handler ever runs.
    #[derive(Serialize)]
    struct MissingChannel {
        text: String,
    }

    let send_message: TypedAction<MissingChannel, SendMessageResult> = TypedAction::new("slack", "sendMessage");
    let caller = view.action("slack", "sendMessage");
    let result = send_message.call(&caller, MissingChannel { text: "hello".to_string() }).await;

    assert!(matches!(result, Err(junction_core::Error::ActionInputInvalid { .. })));
}
