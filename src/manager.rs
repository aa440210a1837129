//! The non-scoped [`Manager`]: connector listing, default-config action
//! invocation, and the crate's sole HTTP boundary — [`Manager::handle`] for
//! OAuth callbacks and webhooks, plus [`Manager::start_oauth`] for the
//! install-time redirect.
//!
//! [`HandleRequest`]/[`HandleResponse`] are plain data, not axum types: web
//! framework glue is deliberately out of scope here, so a host's own router
//! adapts its request/response into this shape, the same way
//! [`crate::scope`] stays framework-agnostic for `install`'s 302 path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;

use crate::cookie::OAuthCookiePayload;
use crate::error::{Code, Error, Result};
use crate::events::{Event, EventBase};
use crate::registry::{HookEvent, Registry, WebhookInput};
use crate::schema::ValidationOutcome;
use crate::scope::{run_action, ActionOutcome, ConfigSource, RedirectResponse, ScopedView};
use crate::storage::{NewConnectorRecordBuilder, WebhookEventResult, WebhookMetadataUpdate};
use crate::url::{parse_oauth_callback_url, parse_webhook_url};

/// Whether a connector requires OAuth or is a plain config-only integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    OAuth,
    Custom,
}

/// One row of [`Manager::list`] / the result of [`Manager::get`].
#[derive(Debug, Clone)]
pub struct ConnectorSummary {
    pub key: String,
    pub kind: ConnectorKind,
    pub metadata: Option<Value>,
    pub connections: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub count_connections: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub count_connections: bool,
}

/// An inbound request to [`Manager::handle`]. `raw_body` is kept distinct
/// from the parsed JSON the webhook schema sees, because signature
/// verification must run over the exact bytes the provider sent —
/// re-serializing a parsed `Value` would break HMAC-style verifiers whose
/// signature covers byte-for-byte whitespace and key order.
#[derive(Debug, Clone, Default)]
pub struct HandleRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub raw_body: Vec<u8>,
}

/// What [`Manager::handle`] returns; a host's web framework glue maps this
/// onto its own response type.
#[derive(Debug, Clone)]
pub enum HandleResponse {
    Json { status: u16, body: Value },
    Redirect { status: u16, location: String, set_cookie: Option<String> },
}

impl HandleResponse {
    fn error(status: u16, message: impl Into<String>) -> Self {
        HandleResponse::Json { status, body: serde_json::json!({"data": null, "error": message.into()}) }
    }
}

/// The non-scoped façade over a built [`Registry`].
pub struct Manager {
    registry: Arc<Registry>,
}

impl Manager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The entry point every per-tenant operation goes through.
    pub fn scope(&self, key: &str, identity: Option<&str>) -> Result<ScopedView> {
        let def = self.registry.scope_def(key)?;
        let identity = identity.unwrap_or("").to_string();
        if def.required && identity.is_empty() {
            return Err(Error::ScopeIdentifierRequired(key.to_string()));
        }
        Ok(ScopedView::new(self.registry.clone(), key.to_string(), identity))
    }

    /// Lists connectors, optionally filtered by name substring, paginated,
    /// and with connection counts attached.
    pub async fn list(&self, options: ListOptions) -> Result<Vec<ConnectorSummary>> {
        let mut keys: Vec<&String> = self.registry.connectors.keys().collect();
        keys.sort();

        let mut summaries = Vec::new();
        for key in keys {
            if let Some(filter) = &options.name {
                if !key.contains(filter.as_str()) {
                    continue;
                }
            }
            summaries.push(self.summarize(key, options.count_connections).await?);
        }

        let offset = options.offset.unwrap_or(0);
        let iter = summaries.into_iter().skip(offset);
        Ok(match options.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    /// Returns `None` rather than `Err` for an unknown connector — this is
    /// a lookup, not an operation that requires the connector to exist.
    pub async fn get(&self, key: &str, options: GetOptions) -> Result<Option<ConnectorSummary>> {
        if self.registry.connector(key).is_err() {
            return Ok(None);
        }
        Ok(Some(self.summarize(key, options.count_connections).await?))
    }

    async fn summarize(&self, key: &str, count_connections: bool) -> Result<ConnectorSummary> {
        let connector = self.registry.connector(key)?;
        let connections =
            if count_connections { Some(self.registry.storage.count_connections(key).await?) } else { None };
        Ok(ConnectorSummary {
            key: key.to_string(),
            kind: if connector.is_oauth() { ConnectorKind::OAuth } else { ConnectorKind::Custom },
            metadata: connector.metadata.clone(),
            connections,
        })
    }

    /// Calls an action using only the connector's default config; fails
    /// with `DEFAULT_CONFIG_REQUIRED` if it has none. Runs the same pipeline
    /// as a scoped call, with `scope="default"`, `identity=""`.
    pub fn action<'a>(&'a self, connector_key: &'a str, action_name: &'a str) -> DefaultActionCaller<'a> {
        DefaultActionCaller { registry: self.registry.as_ref(), connector_key, action_name }
    }

    /// Emits `oauth.started` and returns a 302 to the provider's
    /// authorization URL with the callback-recovery cookie.
    pub async fn start_oauth(
        &self,
        connector_key: &str,
        scope: &str,
        identity: &str,
        redirect_url: Option<String>,
    ) -> Result<RedirectResponse> {
        start_oauth_redirect(&self.registry, connector_key, scope, identity, redirect_url).await
    }

    /// The sole HTTP boundary. Never panics or propagates an error to the
    /// caller: any failure becomes a JSON body with the status the crate's
    /// error taxonomy assigns it, except the catch-all "unmatched URL" /
    /// pre-cookie OAuth lookup failures, which are always 400.
    pub async fn handle(&self, request: HandleRequest) -> HandleResponse {
        if let Some(parsed) = parse_oauth_callback_url(&request.path) {
            return match self.handle_oauth_callback(&parsed.connector_key, &request).await {
                Ok(resp) => resp,
                Err(err) => HandleResponse::error(400, err.to_string()),
            };
        }
        if let Some(parsed) = parse_webhook_url(&request.path) {
            return match self.handle_webhook(&parsed.connector_key, &parsed.secret, &request).await {
                Ok(resp) => resp,
                Err(err) => HandleResponse::error(err.http_status().as_u16(), err.to_string()),
            };
        }
        HandleResponse::error(400, "Invalid connector URL")
    }

    /// URL/connector/engine lookup propagate as `Err` — there is no redirect
    /// context yet. Past that point, failure is always a 302 error-redirect,
    /// never a 5xx and never an `Err`.
    async fn handle_oauth_callback(&self, connector_key: &str, request: &HandleRequest) -> Result<HandleResponse> {
        self.registry.connector(connector_key)?;
        let engine = self.registry.oauth_engine(connector_key)?;

        let cookie_name = format!("igniter_oauth_{connector_key}");
        let clear_cookie = format!("{cookie_name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
        let recovered = request.cookies.get(&cookie_name).and_then(|raw| self.decode_cookie(raw));

        let (scope, identity, redirect_url) = match &recovered {
            Some(p) => (p.scope.clone(), p.identity.clone(), p.redirect_url.clone()),
            None => ("default".to_string(), String::new(), "/".to_string()),
        };

        let base = EventBase { connector: connector_key.to_string(), scope: scope.clone(), identity: identity.clone(), timestamp: Utc::now() };

        if let Some(provider_error) = request.query.get("error") {
            self.registry
                .emit(Event::OAuthFailed { base, error_code: Code::OauthStateInvalid, error_message: Some(provider_error.clone()) })
                .await;
            return Ok(error_redirect(&redirect_url, connector_key, provider_error, &clear_cookie));
        }

        let (code, state) = match (request.query.get("code"), request.query.get("state")) {
            (Some(c), Some(s)) => (c.clone(), s.clone()),
            _ => {
                let message = "missing code or state in oauth callback".to_string();
                self.registry
                    .emit(Event::OAuthFailed { base, error_code: Code::OauthStateInvalid, error_message: Some(message.clone()) })
                    .await;
                return Ok(error_redirect(&redirect_url, connector_key, &message, &clear_cookie));
            }
        };

        let pending = match engine.validate_state(&state).await {
            Ok(p) => p,
            Err(err) => {
                self.registry.emit(Event::OAuthFailed { base, error_code: err.code(), error_message: Some(err.to_string()) }).await;
                return Ok(error_redirect(&redirect_url, connector_key, &err.to_string(), &clear_cookie));
            }
        };

        let mut tokens = match engine.exchange_code_for_token(&code, pending.code_verifier.as_deref()).await {
            Ok(t) => t,
            Err(err) => {
                self.registry.emit(Event::OAuthFailed { base, error_code: err.code(), error_message: Some(err.to_string()) }).await;
                return Ok(error_redirect(&redirect_url, connector_key, &err.to_string(), &clear_cookie));
            }
        };

        if let Ok(Some(user_info)) = engine.user_info(&tokens.access_token).await {
            tokens.user_info = Some(user_info);
        }

        let connector = self.registry.connector(connector_key)?;
        let mut value = connector.default_config.clone().unwrap_or_default();
        value.insert("oauth".to_string(), serde_json::to_value(&tokens).expect("OAuthData always serializes"));
        self.registry.crypto.encrypt_config(&mut value, &connector.encrypted_fields)?;
        self.registry.crypto.encrypt_oauth_tokens(&mut value)?;

        self.registry
            .storage
            .save(
                NewConnectorRecordBuilder::default()
                    .scope(scope.clone())
                    .identity(identity.clone())
                    .provider(connector_key.to_string())
                    .value(value)
                    .enabled(true)
                    .build()
                    .map_err(|e| Error::DatabaseFailed(e.to_string()))?,
            )
            .await?;

        if let Some(hook) = &self.registry.on_connect {
            hook.on_connect(HookEvent { connector: connector_key, scope: &scope, identity: &identity })
                .await
                .map_err(|e| Error::DatabaseFailed(e.to_string()))?;
        }

        self.registry.emit(Event::OAuthCompleted(base.clone())).await;
        self.registry.emit(Event::ConnectorConnected(base)).await;

        Ok(HandleResponse::Redirect {
            status: 302,
            location: format!("{redirect_url}?status=success&connector={connector_key}"),
            set_cookie: Some(clear_cookie),
        })
    }

    async fn handle_webhook(&self, connector_key: &str, secret: &str, request: &HandleRequest) -> Result<HandleResponse> {
        let connector = self.registry.connector(connector_key)?;
        let webhook = connector.webhook.as_ref().ok_or_else(|| Error::WebhookNotConfigured(connector_key.to_string()))?;

        let record = self
            .registry
            .storage
            .find_by_webhook_secret(connector_key, secret)
            .await?
            .ok_or(Error::WebhookVerificationFailed)?;

        let mut config = record.value.clone();
        self.registry.crypto.decrypt_config(&mut config, &connector.encrypted_fields)?;

        if let Some(verifier) = &webhook.verify {
            let verified = verifier.verify(&request.raw_body, &request.headers, &config).await;
            if !verified {
                self.registry
                    .storage
                    .update_webhook_metadata(
                        &record.scope,
                        &record.identity,
                        connector_key,
                        WebhookMetadataUpdate { last_event_at: Utc::now(), last_event_result: WebhookEventResult::Error, error: Some("signature".to_string()) },
                    )
                    .await?;
                return Err(Error::WebhookVerificationFailed);
            }
        }

        let body: Value = serde_json::from_slice(&request.raw_body).unwrap_or(Value::Null);
        let payload = match connector.compiled_webhook_schema.as_ref().expect("webhook schema compiled at registration").validate(body) {
            ValidationOutcome::Ok(v) => v,
            ValidationOutcome::Err(issues) => {
                let joined = issues.iter().map(|i| i.message.clone()).collect::<Vec<_>>().join("; ");
                self.registry
                    .storage
                    .update_webhook_metadata(
                        &record.scope,
                        &record.identity,
                        connector_key,
                        WebhookMetadataUpdate { last_event_at: Utc::now(), last_event_result: WebhookEventResult::Error, error: Some(joined) },
                    )
                    .await?;
                return Err(Error::WebhookValidationFailed { issues });
            }
        };

        let context = match &connector.on_context {
            Some(hook) => Some(
                hook.on_context(&config, &record.scope, &record.identity)
                    .await
                    .map_err(|e| Error::DatabaseFailed(e.to_string()))?,
            ),
            None => None,
        };

        let base = EventBase { connector: connector_key.to_string(), scope: record.scope.clone(), identity: record.identity.clone(), timestamp: Utc::now() };
        self.registry
            .emit(Event::WebhookReceived {
                base: base.clone(),
                method: Some(request.method.clone()),
                path: Some(request.path.clone()),
                verified: Some(webhook.verify.is_some()),
            })
            .await;

        let start = Instant::now();
        let handler_input = WebhookInput {
            payload,
            config,
            context,
            scope: record.scope.clone(),
            identity: record.identity.clone(),
            headers: request.headers.clone(),
        };

        match webhook.handler.call(handler_input).await {
            Ok(data) => {
                self.registry
                    .storage
                    .update_webhook_metadata(
                        &record.scope,
                        &record.identity,
                        connector_key,
                        WebhookMetadataUpdate { last_event_at: Utc::now(), last_event_result: WebhookEventResult::Success, error: None },
                    )
                    .await?;
                let duration_ms = start.elapsed().as_millis() as u64;
                self.registry.emit(Event::WebhookProcessed { base, duration_ms: Some(duration_ms) }).await;
                Ok(HandleResponse::Json { status: 200, body: data })
            }
            Err(err) => {
                self.registry
                    .storage
                    .update_webhook_metadata(
                        &record.scope,
                        &record.identity,
                        connector_key,
                        WebhookMetadataUpdate { last_event_at: Utc::now(), last_event_result: WebhookEventResult::Error, error: Some(err.to_string()) },
                    )
                    .await?;
                let duration_ms = start.elapsed().as_millis() as u64;
                let crate_error =
                    Error::ActionFailed { connector: connector_key.to_string(), action: "webhook".to_string(), message: err.to_string() };
                self.registry
                    .emit(Event::WebhookFailed { base, duration_ms: Some(duration_ms), error_code: crate_error.code(), error_message: Some(err.to_string()) })
                    .await;
                Err(crate_error)
            }
        }
    }

    fn decode_cookie(&self, raw: &str) -> Option<OAuthCookiePayload> {
        if let Some(signer) = &self.registry.cookie_signer {
            return signer.decode(raw);
        }
        let json = URL_SAFE_NO_PAD.decode(raw).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

/// Bound to one `(connector, action)` pair invoked with the connector's
/// default config.
pub struct DefaultActionCaller<'a> {
    registry: &'a Registry,
    connector_key: &'a str,
    action_name: &'a str,
}

impl<'a> DefaultActionCaller<'a> {
    pub async fn call(&self, input: Value) -> Result<ActionOutcome> {
        run_action(self.registry, "default", "", self.connector_key, self.action_name, input, ConfigSource::Default).await
    }
}

/// Shared by [`Manager::start_oauth`] and [`crate::scope::ScopedView::install`]
/// — install on an OAuth connector delegates here instead of writing a
/// record directly.
pub(crate) async fn start_oauth_redirect(
    registry: &Arc<Registry>,
    connector_key: &str,
    scope: &str,
    identity: &str,
    redirect_url: Option<String>,
) -> Result<RedirectResponse> {
    let engine = registry.oauth_engine(connector_key)?;
    let redirect_url = redirect_url.unwrap_or_else(|| "/".to_string());
    let auth = engine.generate_auth_url(scope, identity, None).await?;

    registry
        .emit(Event::OAuthStarted(EventBase {
            connector: connector_key.to_string(),
            scope: scope.to_string(),
            identity: identity.to_string(),
            timestamp: Utc::now(),
        }))
        .await;

    let payload = OAuthCookiePayload { scope: scope.to_string(), identity: identity.to_string(), redirect_url, state: auth.state.clone() };
    let cookie_value = match &registry.cookie_signer {
        Some(signer) => signer.encode(&payload),
        None => URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).expect("OAuthCookiePayload always serializes")),
    };

    let set_cookie = format!("igniter_oauth_{connector_key}={cookie_value}; Path=/; HttpOnly; SameSite=Lax; Max-Age=600");

    Ok(RedirectResponse { location: auth.url, set_cookie })
}

fn error_redirect(redirect_url: &str, connector_key: &str, message: &str, clear_cookie: &str) -> HandleResponse {
    let encoded_message = utf8_percent_encode(message, NON_ALPHANUMERIC).to_string();
    HandleResponse::Redirect {
        status: 302,
        location: format!("{redirect_url}?status=error&connector={connector_key}&error={encoded_message}"),
        set_cookie: Some(clear_cookie.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;
    use crate::registry::{ActionHandler, ActionInput, ConnectorDefinitionSpecBuilder, Registry};
    use crate::storage::InMemoryAdapter;
    use async_trait::async_trait;

    struct EchoAction;
    #[async_trait]
    impl ActionHandler for EchoAction {
        async fn call(&self, input: ActionInput) -> anyhow::Result<Value> {
            Ok(input.input)
        }
    }

    fn registry() -> Arc<Registry> {
        let connector = ConnectorDefinitionSpecBuilder::default()
            .key("slack".to_string())
            .config_schema(serde_json::json!({"type": "object"}))
            .action(
                crate::registry::ActionDefinitionBuilder::default()
                    .name("post".to_string())
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
            .scope(crate::registry::ScopeDefinition::new("organization", true))
            .connector(connector)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn handle_rejects_unmatched_url() {
        let manager = Manager::new(registry());
        let response = manager
            .handle(HandleRequest { method: "GET".into(), path: "/not-a-connector-path".into(), ..Default::default() })
            .await;
        match response {
            HandleResponse::Json { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body["error"], "Invalid connector URL");
            }
            _ => panic!("expected json response"),
        }
    }

    #[tokio::test]
    async fn list_and_get_roundtrip() {
        let manager = Manager::new(registry());
        let all = manager.list(ListOptions::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "slack");

        let one = manager.get("slack", GetOptions::default()).await.unwrap();
        assert!(one.is_some());
        assert!(manager.get("nope", GetOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn default_action_requires_default_config() {
        let manager = Manager::new(registry());
        let result = manager.action("slack", "post").call(serde_json::json!({})).await;
        assert!(matches!(result, Err(Error::ConnectorDefaultConfigRequired(_))));
    }

    #[tokio::test]
    async fn webhook_on_unconfigured_connector_is_bad_request() {
        let manager = Manager::new(registry());
        let response = manager
            .handle(HandleRequest {
                method: "POST".into(),
                path: "/api/connectors/slack/webhook/some-secret".into(),
                ..Default::default()
            })
            .await;
        match response {
            HandleResponse::Json { status, .. } => assert_eq!(status, 400),
            _ => panic!("expected json response"),
        }
    }
}
