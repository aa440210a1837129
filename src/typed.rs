//! A typed convenience wrapper over [`ActionCaller`]/[`DefaultActionCaller`]
//! that gives `action(..).call(input)` compile-time input/output types.
//!
//! This changes nothing about dispatch: the handler still runs through
//! [`crate::scope::run_action`] against a plain `serde_json::Value`. All
//! `TypedAction` adds is `serde_json::to_value`/`from_value` at the edges.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::scope::{ActionCaller, ActionOutcome};

/// `{data, error}` with `data` decoded into `Out`, mirroring [`ActionOutcome`]
/// but with a typed success payload.
#[derive(Debug, Clone)]
pub struct TypedActionOutcome<Out> {
    pub data: Option<Out>,
    pub error: Option<crate::scope::ActionError>,
}

/// Binds a `(connector, action)` pair to input/output types. Build one with
/// [`TypedAction::new`] and call [`TypedAction::call`] the way you'd call
/// `action(..).call(..)` directly, minus the manual `serde_json::Value`
/// conversion on either side.
pub struct TypedAction<In, Out> {
    connector_key: String,
    action_name: String,
    _marker: PhantomData<(In, Out)>,
}

impl<In, Out> TypedAction<In, Out>
where
    In: Serialize,
    Out: DeserializeOwned,
{
    pub fn new(connector_key: impl Into<String>, action_name: impl Into<String>) -> Self {
        Self { connector_key: connector_key.into(), action_name: action_name.into(), _marker: PhantomData }
    }

    pub fn connector_key(&self) -> &str {
        &self.connector_key
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    /// Serializes `input`, runs it through `caller` (typically
    /// `scoped_view.action(self.connector_key(), self.action_name())`), and
    /// decodes a successful payload back into `Out`. A handler-level failure
    /// still comes back as `Ok(TypedActionOutcome{error: Some(..), ..})`,
    /// matching [`ActionOutcome`]'s documented asymmetry; only pre-dispatch
    /// failures and output decode failures propagate as `Err`.
    pub async fn call(&self, caller: &ActionCaller<'_>, input: In) -> Result<TypedActionOutcome<Out>> {
        let input_value = serde_json::to_value(input).map_err(|e| Error::ActionInputInvalid {
            issues: vec![crate::error::ValidationIssue { path: String::new(), message: e.to_string() }],
        })?;

        let ActionOutcome { data, error } = caller.call(input_value).await?;
        let data = match data {
            Some(value) => Some(decode_output(value)?),
            None => None,
        };
        Ok(TypedActionOutcome { data, error })
    }
}

fn decode_output<Out: DeserializeOwned>(value: Value) -> Result<Out> {
    serde_json::from_value(value).map_err(|e| Error::ActionOutputInvalid {
        issues: vec![crate::error::ValidationIssue { path: String::new(), message: e.to_string() }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;
    use crate::registry::{
        ActionDefinitionBuilder, ActionHandler, ActionInput, ConnectorDefinitionSpecBuilder, Registry, ScopeDefinition,
    };
    use crate::storage::InMemoryAdapter;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Serialize)]
    struct Ping {
        message: String,
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Pong {
        echoed: String,
    }

    struct EchoAction;
    #[async_trait]
    impl ActionHandler for EchoAction {
        async fn call(&self, input: ActionInput) -> anyhow::Result<Value> {
            let message = input.input.get("message").and_then(Value::as_str).unwrap_or_default();
            Ok(serde_json::json!({ "echoed": message }))
        }
    }

    fn registry() -> Arc<Registry> {
        let connector = ConnectorDefinitionSpecBuilder::default()
            .key("echo".to_string())
            .config_schema(serde_json::json!({"type": "object"}))
            .action(
                ActionDefinitionBuilder::default()
                    .name("ping".to_string())
                    .input_schema(serde_json::json!({"type": "object"}))
                    .handler(Arc::new(EchoAction) as Arc<dyn ActionHandler>)
                    .build()
                    .unwrap(),
            )
            .finish()
            .unwrap();

        Registry::builder()
            .storage(InMemoryAdapter::new())
            .crypto(Crypto::builtin("12345678901234567890123456789012").unwrap())
            .scope(ScopeDefinition::new("organization", true))
            .connector(connector)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn typed_action_round_trips_through_json() {
        let registry = registry();
        let view = crate::scope::ScopedView::new(registry.clone(), "organization".to_string(), "org_1".to_string());
        view.install("echo", std::collections::HashMap::new(), None).await.unwrap();

        let action: TypedAction<Ping, Pong> = TypedAction::new("echo", "ping");
        let caller = view.action("echo", "ping");
        let outcome = action.call(&caller, Ping { message: "hi".to_string() }).await.unwrap();

        assert_eq!(outcome.data, Some(Pong { echoed: "hi".to_string() }));
        assert!(outcome.error.is_none());
    }
}
