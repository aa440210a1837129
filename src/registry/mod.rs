//! Connector/scope registry and action dispatch.
//!
//! `ConnectorDefinition`, `ActionDefinition` and `WebhookDefinition` are
//! builder-constructed bags of config — a config schema plus a map of named
//! actions — rather than one Rust trait per external provider, because a
//! connector is data, not a bespoke service client. The genuinely pluggable
//! seams (action handlers, webhook handlers/verifiers, lifecycle hooks) stay
//! trait objects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use derive_builder::Builder;
use reqwest::{Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{default_on_request_failure, RetryTransientMiddleware, Retryable, RetryableStrategy};
use serde_json::Value;

use crate::cookie::CookieSigner;
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Subscriber, TelemetrySink, TracingTelemetrySink};
use crate::oauth::{OAuthConfig, OAuthEngine};
use crate::schema::Schema;
use crate::storage::StorageAdapter;
use crate::url::BaseUrl;

/// `{key, required}` — whether deriving a scoped view requires an
/// identity.
#[derive(Debug, Clone)]
pub struct ScopeDefinition {
    pub key: String,
    pub required: bool,
}

impl ScopeDefinition {
    pub fn new(key: impl Into<String>, required: bool) -> Self {
        Self { key: key.into(), required }
    }
}

/// Arguments passed to an [`ActionHandler`].
pub struct ActionInput {
    pub input: Value,
    pub config: HashMap<String, Value>,
    pub context: Option<Value>,
    pub oauth: Option<Value>,
    pub scope: String,
    pub identity: String,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, input: ActionInput) -> anyhow::Result<Value>;
}

/// Arguments passed to a [`WebhookHandler`].
pub struct WebhookInput {
    pub payload: Value,
    pub config: HashMap<String, Value>,
    pub context: Option<Value>,
    pub scope: String,
    pub identity: String,
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn call(&self, input: WebhookInput) -> anyhow::Result<Value>;
}

/// Optional signature verification. Returns `false` to signal
/// verification failure rather than erroring.
#[async_trait]
pub trait WebhookVerifier: Send + Sync {
    async fn verify(&self, raw_body: &[u8], headers: &HashMap<String, String>, config: &HashMap<String, Value>) -> bool;
}

/// Per-connector `on_context` hook, run before an action or webhook
/// handler to build shared request context.
#[async_trait]
pub trait ContextHook: Send + Sync {
    async fn on_context(&self, config: &HashMap<String, Value>, scope: &str, identity: &str) -> anyhow::Result<Value>;
}

/// Per-connector `on_validate` hook, run during install after schema
/// validation passes.
#[async_trait]
pub trait ValidateHook: Send + Sync {
    async fn on_validate(&self, config: &HashMap<String, Value>) -> anyhow::Result<()>;
}

/// `{schema, handler, verify?}`.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct WebhookDefinition {
    pub schema: Value,
    pub handler: Arc<dyn WebhookHandler>,
    #[builder(default)]
    pub verify: Option<Arc<dyn WebhookVerifier>>,
}

/// `{description?, input_schema, output_schema?, handler}`.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ActionDefinition {
    pub name: String,
    #[builder(default)]
    pub description: Option<String>,
    pub input_schema: Value,
    #[builder(default)]
    pub output_schema: Option<Value>,
    pub handler: Arc<dyn ActionHandler>,
}

/// In-memory-only connector metadata. Holds compiled schemas rather than
/// raw JSON Schema documents — they're compiled once at registration so
/// install/action calls never pay compile cost per request.
pub struct ConnectorDefinition {
    pub key: String,
    pub config_schema: Value,
    pub(crate) compiled_config_schema: Schema,
    pub metadata_schema: Option<Value>,
    pub metadata: Option<Value>,
    pub default_config: Option<HashMap<String, Value>>,
    pub oauth: Option<OAuthConfig>,
    pub webhook: Option<WebhookDefinition>,
    pub(crate) compiled_webhook_schema: Option<Schema>,
    pub actions: HashMap<String, ActionDefinition>,
    pub(crate) compiled_action_schemas: HashMap<String, Schema>,
    pub on_context: Option<Arc<dyn ContextHook>>,
    pub on_validate: Option<Arc<dyn ValidateHook>>,
    pub encrypted_fields: Vec<String>,
}

impl ConnectorDefinition {
    pub fn action(&self, name: &str) -> Result<&ActionDefinition> {
        self.actions
            .get(name)
            .ok_or_else(|| Error::ActionNotFound { connector: self.key.clone(), action: name.to_string() })
    }

    pub fn is_oauth(&self) -> bool {
        self.oauth.is_some()
    }
}

/// Builder input for a connector. Distinct from [`ConnectorDefinition`]
/// because the latter carries compiled schemas derived from this one at
/// `Registry::build` time.
#[derive(Builder)]
#[builder(pattern = "owned", build_fn(skip))]
pub struct ConnectorDefinitionSpec {
    pub key: String,
    pub config_schema: Value,
    #[builder(default)]
    pub metadata_schema: Option<Value>,
    #[builder(default)]
    pub metadata: Option<Value>,
    #[builder(default)]
    pub default_config: Option<HashMap<String, Value>>,
    #[builder(default)]
    pub oauth: Option<OAuthConfig>,
    #[builder(default)]
    pub webhook: Option<WebhookDefinition>,
    #[builder(default)]
    pub actions: HashMap<String, ActionDefinition>,
    #[builder(default)]
    pub on_context: Option<Arc<dyn ContextHook>>,
    #[builder(default)]
    pub on_validate: Option<Arc<dyn ValidateHook>>,
    #[builder(default)]
    pub encrypted_fields: Vec<String>,
}

impl ConnectorDefinitionSpecBuilder {
    pub fn action(mut self, def: ActionDefinition) -> Self {
        let mut actions = self.actions.unwrap_or_default();
        actions.insert(def.name.clone(), def);
        self.actions = Some(actions);
        self
    }

    /// Compiles the config/webhook/action schemas and produces the final
    /// [`ConnectorDefinition`]. Named `finish` (not `build`) because the
    /// macro-generated `build` is suppressed via `build_fn(skip)` — schema
    /// compilation can fail, and [`Schema::compile`] reports that as a plain
    /// `String` (see its own doc comment), so this keeps the same error type
    /// rather than inventing a crate-`Error` variant for a connector
    /// registration mistake the host should fix before shipping, not handle
    /// at runtime.
    pub fn finish(self) -> std::result::Result<ConnectorDefinition, String> {
        let key = self.key.ok_or_else(|| "connector key is required".to_string())?;
        let config_schema = self.config_schema.ok_or_else(|| "connector config_schema is required".to_string())?;
        let compiled_config_schema = Schema::compile(config_schema.clone())?;

        let webhook = self.webhook.unwrap_or_default();
        let compiled_webhook_schema = match &webhook {
            Some(w) => Some(Schema::compile(w.schema.clone())?),
            None => None,
        };

        let actions = self.actions.unwrap_or_default();
        let mut compiled_action_schemas = HashMap::new();
        for (name, action) in &actions {
            let compiled = Schema::compile(action.input_schema.clone())?;
            compiled_action_schemas.insert(name.clone(), compiled);
        }

        Ok(ConnectorDefinition {
            key,
            config_schema,
            compiled_config_schema,
            metadata_schema: self.metadata_schema.unwrap_or_default(),
            metadata: self.metadata.unwrap_or_default(),
            default_config: self.default_config.unwrap_or_default(),
            oauth: self.oauth.unwrap_or_default(),
            webhook,
            compiled_webhook_schema,
            actions,
            compiled_action_schemas,
            on_context: self.on_context.unwrap_or_default(),
            on_validate: self.on_validate.unwrap_or_default(),
            encrypted_fields: self.encrypted_fields.unwrap_or_default(),
        })
    }
}

/// Registry-wide lifecycle hooks (on_connect, on_disconnect, on_error).
/// Distinct from the per-connector `on_context`/`on_validate` hooks.
pub struct HookEvent<'a> {
    pub connector: &'a str,
    pub scope: &'a str,
    pub identity: &'a str,
}

#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self, event: HookEvent<'_>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DisconnectHook: Send + Sync {
    async fn on_disconnect(&self, event: HookEvent<'_>) -> anyhow::Result<()>;
}

pub struct ErrorHookEvent<'a> {
    pub connector: &'a str,
    pub scope: &'a str,
    pub identity: &'a str,
    pub operation: &'a str,
    pub error: &'a Error,
}

#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(&self, event: ErrorHookEvent<'_>) -> anyhow::Result<()>;
}

/// Holds immutable references to the storage adapter, crypto policy, scope
/// map, connector map, OAuth-engine cache, lifecycle hooks and telemetry.
/// Subscribers are the one mutable-after-build piece.
pub struct Registry {
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) crypto: Crypto,
    pub(crate) events: Arc<EventBus>,
    pub(crate) scopes: HashMap<String, ScopeDefinition>,
    pub(crate) connectors: HashMap<String, Arc<ConnectorDefinition>>,
    pub(crate) oauth_engines: HashMap<String, Arc<OAuthEngine>>,
    pub(crate) base_url: Option<BaseUrl>,
    pub(crate) base_path: String,
    pub(crate) on_connect: Option<Arc<dyn ConnectHook>>,
    pub(crate) on_disconnect: Option<Arc<dyn DisconnectHook>>,
    pub(crate) on_error: Option<Arc<dyn ErrorHook>>,
    /// Signs the `igniter_oauth_<connector>` callback-recovery cookie when
    /// a secret is supplied; `None` falls back to an unsigned base64url
    /// encoding (see [`crate::manager`]).
    pub(crate) cookie_signer: Option<CookieSigner>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn scope_def(&self, key: &str) -> Result<&ScopeDefinition> {
        self.scopes.get(key).ok_or_else(|| Error::ScopeInvalid(key.to_string()))
    }

    pub fn connector(&self, key: &str) -> Result<&Arc<ConnectorDefinition>> {
        self.connectors.get(key).ok_or_else(|| Error::ConnectorNotFound(key.to_string()))
    }

    pub fn oauth_engine(&self, key: &str) -> Result<&Arc<OAuthEngine>> {
        self.oauth_engines.get(key).ok_or_else(|| Error::OauthNotConfigured(key.to_string()))
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.events.subscribe(subscriber).await;
    }

    pub async fn emit(&self, event: Event) {
        self.events.emit(event).await;
    }
}

/// Builds a [`Registry`]. Hand-rolled rather than `#[derive(Builder)]`
/// because `build()` performs cross-field validation (the `BUILD_*_REQUIRED`
/// error codes) and a side effect (instantiating one [`OAuthEngine`] per
/// OAuth-enabled connector) that a generated builder's single
/// `Result<T, String>` return doesn't model cleanly.
#[derive(Default)]
pub struct RegistryBuilder {
    storage: Option<Arc<dyn StorageAdapter>>,
    crypto: Option<Crypto>,
    telemetry_sink: Option<Arc<dyn TelemetrySink>>,
    base_url: Option<String>,
    base_path: Option<String>,
    scopes: Vec<ScopeDefinition>,
    connectors: Vec<ConnectorDefinition>,
    on_connect: Option<Arc<dyn ConnectHook>>,
    on_disconnect: Option<Arc<dyn DisconnectHook>>,
    on_error: Option<Arc<dyn ErrorHook>>,
    http: Option<ClientWithMiddleware>,
    secret: Option<String>,
}

impl RegistryBuilder {
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn crypto(mut self, crypto: Crypto) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry_sink = Some(sink);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn scope(mut self, scope: ScopeDefinition) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn connector(mut self, connector: ConnectorDefinition) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn on_connect(mut self, hook: Arc<dyn ConnectHook>) -> Self {
        self.on_connect = Some(hook);
        self
    }

    pub fn on_disconnect(mut self, hook: Arc<dyn DisconnectHook>) -> Self {
        self.on_disconnect = Some(hook);
        self
    }

    pub fn on_error(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.on_error = Some(hook);
        self
    }

    pub fn http_client(mut self, client: ClientWithMiddleware) -> Self {
        self.http = Some(client);
        self
    }

    /// Secret used to sign the OAuth callback-recovery cookie. Typically the
    /// same value passed to [`Crypto::builtin`]; without it the cookie falls
    /// back to an unsigned encoding rather than failing registry
    /// construction.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn build(self) -> Result<Arc<Registry>> {
        let storage = self.storage.ok_or(Error::BuildConfigRequired)?;
        if self.scopes.is_empty() {
            return Err(Error::BuildScopesRequired);
        }
        if self.connectors.is_empty() {
            return Err(Error::BuildConnectorsRequired);
        }

        let crypto = match self.crypto {
            Some(crypto) => crypto,
            None => {
                let secret = std::env::var("IGNITER_SECRET").map_err(|_| Error::EncryptionSecretRequired)?;
                Crypto::builtin(secret).map_err(|_| Error::EncryptionSecretRequired)?
            }
        };
        let http = self.http.unwrap_or_else(default_http_client);

        let base_url = BaseUrl::resolve(self.base_url.as_deref());
        let base_path = self.base_path.unwrap_or_else(|| "/api/connectors".to_string());

        let scopes = self.scopes.into_iter().map(|s| (s.key.clone(), s)).collect();

        let mut connectors = HashMap::new();
        let mut oauth_engines = HashMap::new();
        for connector in self.connectors {
            if let Some(oauth_config) = &connector.oauth {
                let engine = OAuthEngine::new(clone_oauth_config(oauth_config), http.clone());
                oauth_engines.insert(connector.key.clone(), Arc::new(engine));
            }
            connectors.insert(connector.key.clone(), Arc::new(connector));
        }

        let sink: Arc<dyn TelemetrySink> = self.telemetry_sink.unwrap_or_else(|| Arc::new(TracingTelemetrySink));
        let events = Arc::new(EventBus::new(Some(sink)));
        let cookie_signer = self.secret.map(CookieSigner::new);

        Ok(Arc::new(Registry {
            storage,
            crypto,
            events,
            scopes,
            connectors,
            oauth_engines,
            base_url,
            base_path,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            on_error: self.on_error,
            cookie_signer,
        }))
    }
}

/// Retries a 429 or a transient network failure on the OAuth token/user-info
/// HTTP calls.
struct OAuthRetryStrategy;

impl RetryableStrategy for OAuthRetryStrategy {
    fn handle(&self, res: &std::result::Result<Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(success) if success.status() == StatusCode::TOO_MANY_REQUESTS => Some(Retryable::Transient),
            Ok(_) => None,
            Err(error) => default_on_request_failure(error),
        }
    }
}

/// The OAuth engines' default HTTP client when a host doesn't supply its own
/// via [`RegistryBuilder::http_client`]: a handful of retries on rate limits
/// and transient failures against third-party token/user-info endpoints.
fn default_http_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let retry_strategy = RetryTransientMiddleware::new_with_policy_and_strategy(retry_policy, OAuthRetryStrategy);
    ClientBuilder::new(reqwest::Client::new()).with(retry_strategy).build()
}

/// `OAuthConfig` has no `Clone` derive (its builder targets `pattern =
/// "owned"`), so the registry copies the handful of scalar/collection fields
/// it needs to hand a fresh, independently-owned config to each
/// [`OAuthEngine`].
fn clone_oauth_config(config: &OAuthConfig) -> OAuthConfig {
    OAuthConfig {
        authorization_url: config.authorization_url.clone(),
        token_url: config.token_url.clone(),
        user_info_url: config.user_info_url.clone(),
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        scopes: config.scopes.clone(),
        pkce: config.pkce,
        extra_auth_params: config.extra_auth_params.clone(),
        redirect_uri: config.redirect_uri.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryAdapter;

    struct NoopAction;
    #[async_trait]
    impl ActionHandler for NoopAction {
        async fn call(&self, input: ActionInput) -> anyhow::Result<Value> {
            Ok(input.input)
        }
    }

    fn slack_connector() -> ConnectorDefinition {
        ConnectorDefinitionSpecBuilder::default()
            .key("slack".to_string())
            .config_schema(serde_json::json!({
                "type": "object",
                "properties": {"apiKey": {"type": "string"}},
                "required": ["apiKey"],
            }))
            .action(
                ActionDefinitionBuilder::default()
                    .name("post".to_string())
                    .input_schema(serde_json::json!({"type": "object"}))
                    .handler(Arc::new(NoopAction) as Arc<dyn ActionHandler>)
                    .build()
                    .unwrap(),
            )
            .finish()
            .unwrap()
    }

    #[test]
    fn build_resolves_crypto_from_env_when_not_supplied() {
        std::env::set_var("IGNITER_SECRET", "12345678901234567890123456789012");
        let result = Registry::builder()
            .storage(InMemoryAdapter::new())
            .scope(ScopeDefinition::new("organization", true))
            .connector(slack_connector())
            .build();
        std::env::remove_var("IGNITER_SECRET");
        assert!(result.is_ok());
    }

    #[test]
    fn build_fails_without_crypto_or_env_secret() {
        std::env::remove_var("IGNITER_SECRET");
        let result = Registry::builder()
            .storage(InMemoryAdapter::new())
            .scope(ScopeDefinition::new("organization", true))
            .connector(slack_connector())
            .build();
        assert!(matches!(result, Err(Error::EncryptionSecretRequired)));
    }

    #[test]
    fn build_requires_storage() {
        let result = Registry::builder().scope(ScopeDefinition::new("organization", true)).connector(slack_connector()).build();
        assert!(matches!(result, Err(Error::BuildConfigRequired)));
    }

    #[test]
    fn build_requires_scopes() {
        let result = Registry::builder()
            .storage(InMemoryAdapter::new())
            .crypto(Crypto::builtin("12345678901234567890123456789012").unwrap())
            .connector(slack_connector())
            .build();
        assert!(matches!(result, Err(Error::BuildScopesRequired)));
    }

    #[test]
    fn build_requires_connectors() {
        let result = Registry::builder()
            .storage(InMemoryAdapter::new())
            .crypto(Crypto::builtin("12345678901234567890123456789012").unwrap())
            .scope(ScopeDefinition::new("organization", true))
            .build();
        assert!(matches!(result, Err(Error::BuildConnectorsRequired)));
    }

    #[test]
    fn build_succeeds_with_minimum_viable_config() {
        let registry = Registry::builder()
            .storage(InMemoryAdapter::new())
            .crypto(Crypto::builtin("12345678901234567890123456789012").unwrap())
            .scope(ScopeDefinition::new("organization", true))
            .connector(slack_connector())
            .build()
            .unwrap();
        assert!(registry.connector("slack").is_ok());
        assert!(registry.connector("nope").is_err());
    }
}
