//! `junction-core`: a multi-tenant third-party integration manager —
//! connector registry, OAuth 2.0 authorization-code flow, webhook routing
//! and verification, and at-rest field encryption — for hosts that want
//! their own users to connect third-party accounts (Slack, Mailchimp,
//! Stripe, ...) without hand-rolling the OAuth/webhook/encryption plumbing
//! per connector.
//!
//! A host builds a [`Registry`] once (connectors, scopes, storage adapter,
//! crypto policy), wraps it in a [`Manager`], and drives every operation
//! through either the unscoped `Manager` (connector listing, default-config
//! action calls, the HTTP boundary) or a [`ScopedView`] derived via
//! `Manager::scope` (install/disconnect/toggle/action for one tenant).

pub mod cookie;
pub mod crypto;
pub mod error;
pub mod events;
pub mod manager;
pub mod oauth;
pub mod registry;
pub mod schema;
pub mod scope;
pub mod storage;
pub mod typed;
pub mod url;

pub use crypto::{Crypto, CryptoProvider};
pub use error::{Code, Error, Result, ValidationIssue};
pub use events::{Event, EventBase, EventBus, Level, Subscriber, TelemetrySink, TracingTelemetrySink};
pub use manager::{ConnectorKind, ConnectorSummary, GetOptions, HandleRequest, HandleResponse, ListOptions, Manager};
pub use oauth::{OAuthConfig, OAuthConfigBuilder, OAuthData, OAuthEngine, UserInfo};
pub use registry::{
    ActionDefinition, ActionDefinitionBuilder, ActionHandler, ActionInput, ConnectHook, ConnectorDefinition,
    ConnectorDefinitionSpecBuilder, ContextHook, DisconnectHook, ErrorHook, Registry, RegistryBuilder,
    ScopeDefinition, ValidateHook, WebhookDefinition, WebhookDefinitionBuilder, WebhookHandler, WebhookInput,
    WebhookVerifier,
};
pub use schema::{Schema, ValidationOutcome};
pub use scope::{ActionCaller, ActionError, ActionOutcome, InstallOutcome, RedirectResponse, ScopedView};
pub use storage::{ConnectorRecord, InMemoryAdapter, NewConnectorRecord, NewConnectorRecordBuilder, StorageAdapter};
pub use typed::{TypedAction, TypedActionOutcome};
