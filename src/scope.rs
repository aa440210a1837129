//! Scoped view: per-`(scope, identity)` install/disconnect/toggle/
//! action-call operations. The action-call pipeline is shared with
//! [`crate::manager::Manager`]'s unscoped, default-config invocation — same
//! validation + hook + telemetry pipeline as a scoped `.call`, but with
//! `scope="default"`, `identity=""` — via [`run_action`].

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use crate::error::{Code, Error, Result};
use crate::events::{Event, EventBase};
use crate::oauth::{is_expired_default, OAuthData};
use crate::registry::{ActionInput, ErrorHookEvent, HookEvent, Registry};
use crate::schema::ValidationOutcome;
use crate::storage::{ConnectorRecord, ConnectorRecordUpdate, NewConnectorRecord, NewConnectorRecordBuilder};
use crate::url::generate_webhook_secret;

/// `{data, error}` returned by `action(...).call(...)`. A handler failure
/// converts into `Some(error)` here rather than an `Err` from
/// [`ActionCaller::call`] — only pre-dispatch failures (lookup,
/// not-connected, decrypt, refresh, validation) propagate as `Err`.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub data: Option<Value>,
    pub error: Option<ActionError>,
}

#[derive(Debug, Clone)]
pub struct ActionError {
    pub code: Code,
    pub message: String,
}

/// What a 302 install/start-OAuth response looks like. [`crate::manager`]
/// turns this into an actual `axum::response::Response`; this module stays
/// framework-agnostic so it's testable without spinning up axum.
#[derive(Debug, Clone)]
pub struct RedirectResponse {
    pub location: String,
    pub set_cookie: String,
}

/// The result of `install`: either a 302 for OAuth connectors (no record
/// written yet) or a freshly persisted record.
pub enum InstallOutcome {
    Redirect(RedirectResponse),
    Connected(ConnectorRecord),
}

/// A `(scope, identity)` binding returned by `Registry::scope(...)`.
pub struct ScopedView {
    registry: std::sync::Arc<Registry>,
    pub scope: String,
    pub identity: String,
}

impl ScopedView {
    pub(crate) fn new(registry: std::sync::Arc<Registry>, scope: String, identity: String) -> Self {
        Self { registry, scope, identity }
    }

    /// `install` a.k.a. "connect". Config validation only runs for non-OAuth
    /// connectors — OAuth connectors supply their config via the callback
    /// after token exchange.
    pub async fn install(
        &self,
        connector_key: &str,
        config: HashMap<String, Value>,
        redirect_url: Option<String>,
    ) -> Result<InstallOutcome> {
        let connector = self.registry.connector(connector_key)?;

        if connector.is_oauth() {
            let redirect = crate::manager::start_oauth_redirect(
                &self.registry,
                connector_key,
                &self.scope,
                &self.identity,
                redirect_url,
            )
            .await?;
            return Ok(InstallOutcome::Redirect(redirect));
        }

        let input_value = Value::Object(config.clone().into_iter().collect());
        match connector.compiled_config_schema.validate(input_value) {
            ValidationOutcome::Ok(_) => {}
            ValidationOutcome::Err(issues) => return Err(Error::ConnectorConfigInvalid { issues }),
        }

        if let Some(hook) = &connector.on_validate {
            hook.on_validate(&config).await.map_err(|e| Error::ValidationFailed {
                issues: vec![crate::error::ValidationIssue { path: String::new(), message: e.to_string() }],
            })?;
        }

        let mut value = config;
        if connector.webhook.is_some() {
            let secret = generate_webhook_secret();
            value.insert(
                "webhook".to_string(),
                serde_json::json!({ "secret": secret, "createdAt": Utc::now().to_rfc3339() }),
            );
        }

        self.registry.crypto.encrypt_config(&mut value, &connector.encrypted_fields)?;

        let record = self
            .registry
            .storage
            .save(
                NewConnectorRecordBuilder::default()
                    .scope(self.scope.clone())
                    .identity(self.identity.clone())
                    .provider(connector_key.to_string())
                    .value(value)
                    .enabled(true)
                    .build()
                    .map_err(|e| Error::DatabaseFailed(e.to_string()))?,
            )
            .await?;

        if let Some(hook) = &self.registry.on_connect {
            hook.on_connect(HookEvent { connector: connector_key, scope: &self.scope, identity: &self.identity })
                .await
                .map_err(|e| Error::DatabaseFailed(e.to_string()))?;
        }

        self.registry.emit(Event::ConnectorConnected(self.event_base(connector_key))).await;

        Ok(InstallOutcome::Connected(record))
    }

    /// `disconnect`.
    pub async fn disconnect(&self, connector_key: &str) -> Result<()> {
        self.registry.connector(connector_key)?;
        self.registry.storage.delete(&self.scope, &self.identity, connector_key).await?;

        self.registry.emit(Event::ConnectorDisconnected(self.event_base(connector_key))).await;

        if let Some(hook) = &self.registry.on_disconnect {
            hook.on_disconnect(HookEvent { connector: connector_key, scope: &self.scope, identity: &self.identity })
                .await
                .map_err(|e| Error::DatabaseFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// `toggle(enabled?)`: flips the current state when `enabled` is
    /// omitted, otherwise sets it explicitly. Returns the new state.
    pub async fn toggle(&self, connector_key: &str, enabled: Option<bool>) -> Result<bool> {
        let current = self
            .registry
            .storage
            .get(&self.scope, &self.identity, connector_key)
            .await?
            .ok_or_else(|| Error::ConnectorNotConnected { connector: connector_key.to_string() })?;

        let new_state = enabled.unwrap_or(!current.enabled);

        self.registry
            .storage
            .update(
                &self.scope,
                &self.identity,
                connector_key,
                ConnectorRecordUpdate { value: None, enabled: Some(new_state) },
            )
            .await?;

        let event = if new_state {
            Event::ConnectorEnabled(self.event_base(connector_key))
        } else {
            Event::ConnectorDisabled(self.event_base(connector_key))
        };
        self.registry.emit(event).await;

        Ok(new_state)
    }

    /// Every connector installed for this `(scope, identity)` bucket, across
    /// providers.
    pub async fn list(&self) -> Result<Vec<ConnectorRecord>> {
        self.registry.storage.list(&self.scope, &self.identity).await
    }

    pub fn action<'a>(&'a self, connector_key: &'a str, action_name: &'a str) -> ActionCaller<'a> {
        ActionCaller { registry: &self.registry, scope: &self.scope, identity: &self.identity, connector_key, action_name }
    }

    fn event_base(&self, connector_key: &str) -> EventBase {
        EventBase { connector: connector_key.to_string(), scope: self.scope.clone(), identity: self.identity.clone(), timestamp: Utc::now() }
    }
}

/// Bound to one `(scope, identity, connector, action)` tuple;
/// `.call(input)` runs the full pipeline.
pub struct ActionCaller<'a> {
    registry: &'a Registry,
    scope: &'a str,
    identity: &'a str,
    connector_key: &'a str,
    action_name: &'a str,
}

impl<'a> ActionCaller<'a> {
    pub async fn call(&self, input: Value) -> Result<ActionOutcome> {
        run_action(self.registry, self.scope, self.identity, self.connector_key, self.action_name, input, ConfigSource::Scoped)
            .await
    }
}

/// Where an action call's config comes from: a persisted, scoped record
/// (normal case) or a connector's default config (Manager's unscoped call).
pub(crate) enum ConfigSource {
    Scoped,
    Default,
}

/// The shared action-call pipeline. `scope`/`identity` are
/// `"default"`/`""` when called from [`crate::manager::Manager::action`].
pub(crate) async fn run_action(
    registry: &Registry,
    scope: &str,
    identity: &str,
    connector_key: &str,
    action_name: &str,
    input: Value,
    source: ConfigSource,
) -> Result<ActionOutcome> {
    let connector = registry.connector(connector_key)?;
    let action = connector.action(action_name)?;

    let mut config = match source {
        ConfigSource::Scoped => {
            let record = registry
                .storage
                .get(scope, identity, connector_key)
                .await?
                .ok_or_else(|| Error::ConnectorNotConnected { connector: connector_key.to_string() })?;
            if !record.enabled {
                return Err(Error::ConnectorNotConnected { connector: connector_key.to_string() });
            }
            let mut value = record.value;
            registry.crypto.decrypt_config(&mut value, &connector.encrypted_fields)?;
            registry.crypto.decrypt_oauth_tokens(&mut value)?;
            value
        }
        ConfigSource::Default => connector
            .default_config
            .clone()
            .ok_or_else(|| Error::ConnectorDefaultConfigRequired(connector_key.to_string()))?,
    };

    let mut oauth_data: Option<OAuthData> = None;
    if let Some(oauth_value) = config.get("oauth").cloned() {
        if let Ok(tokens) = serde_json::from_value::<OAuthData>(oauth_value) {
            let now = Utc::now().timestamp();
            if is_expired_default(&tokens, now) {
                let engine = registry.oauth_engine(connector_key)?;
                if tokens.refresh_token.is_some() {
                    let refreshed = engine.refresh(&tokens).await?;
                    config.insert("oauth".to_string(), serde_json::to_value(&refreshed).unwrap());
                    registry.crypto.encrypt_config(&mut config, &connector.encrypted_fields)?;
                    registry.crypto.encrypt_oauth_tokens(&mut config)?;
                    registry
                        .storage
                        .update(scope, identity, connector_key, ConnectorRecordUpdate { value: Some(config.clone()), enabled: None })
                        .await?;
                    registry
                        .emit(Event::OAuthRefreshed(EventBase {
                            connector: connector_key.to_string(),
                            scope: scope.to_string(),
                            identity: identity.to_string(),
                            timestamp: Utc::now(),
                        }))
                        .await;
                    registry.crypto.decrypt_config(&mut config, &connector.encrypted_fields)?;
                    registry.crypto.decrypt_oauth_tokens(&mut config)?;
                    oauth_data = Some(refreshed);
                } else {
                    return Err(Error::OauthTokenExpired);
                }
            } else {
                oauth_data = Some(tokens);
            }
        }
    }

    let input_validation = connector
        .compiled_action_schemas
        .get(action_name)
        .expect("action schema compiled at registration")
        .validate(input.clone());
    if let ValidationOutcome::Err(issues) = input_validation {
        return Err(Error::ActionInputInvalid { issues });
    }

    let context = match &connector.on_context {
        Some(hook) => Some(
            hook.on_context(&config, scope, identity)
                .await
                .map_err(|e| Error::ActionFailed { connector: connector_key.to_string(), action: action_name.to_string(), message: e.to_string() })?,
        ),
        None => None,
    };

    let base = EventBase { connector: connector_key.to_string(), scope: scope.to_string(), identity: identity.to_string(), timestamp: Utc::now() };
    registry.emit(Event::ActionStarted { base: base.clone(), action: action_name.to_string() }).await;
    let start = Instant::now();

    let oauth_json = oauth_data.and_then(|d| serde_json::to_value(d).ok());
    let handler_input =
        ActionInput { input, config, context, oauth: oauth_json, scope: scope.to_string(), identity: identity.to_string() };

    match action.handler.call(handler_input).await {
        Ok(data) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            registry.emit(Event::ActionCompleted { base, action: action_name.to_string(), duration_ms }).await;
            Ok(ActionOutcome { data: Some(data), error: None })
        }
        Err(err) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let error = ActionError { code: Code::ActionFailed, message: err.to_string() };
            registry
                .emit(Event::ActionFailed {
                    base,
                    action: action_name.to_string(),
                    duration_ms,
                    error_code: error.code,
                    error_message: Some(error.message.clone()),
                })
                .await;

            if let Some(hook) = &registry.on_error {
                let crate_error = Error::ActionFailed {
                    connector: connector_key.to_string(),
                    action: action_name.to_string(),
                    message: error.message.clone(),
                };
                let _ = hook
                    .on_error(ErrorHookEvent { connector: connector_key, scope, identity, operation: "action.call", error: &crate_error })
                    .await;
            }

            Ok(ActionOutcome { data: None, error: Some(error) })
        }
    }
}
