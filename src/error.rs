//! Stable error taxonomy for the connector manager.
//!
//! Every variant corresponds to one of a fixed set of stable, SCREAMING_SNAKE
//! error codes (connector/action/scope/database/oauth/webhook/crypto/build
//! families), carries an HTTP status suggestion, and whatever structured
//! metadata is relevant to that failure. `Manager::handle` is the only place
//! these are flattened into the wire-level `{"data":null,"error":...}` body;
//! everywhere else they propagate as `Result<_, Error>`.

use axum::http::StatusCode;
use thiserror::Error;

/// The stable, serializable code for an [`Error`]. Used in telemetry events
/// (`errorCode`) and is stable across crate versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    ConnectorNotFound,
    ConnectorNotConnected,
    ConnectorAlreadyConnected,
    ConnectorConfigInvalid,
    ConnectorDefaultConfigRequired,
    ActionNotFound,
    ActionInputInvalid,
    ActionOutputInvalid,
    ActionFailed,
    ScopeInvalid,
    ScopeIdentifierRequired,
    DatabaseRequired,
    DatabaseFailed,
    OauthNotConfigured,
    OauthStateInvalid,
    OauthTokenFailed,
    OauthParseTokenFailed,
    OauthParseUserinfoFailed,
    OauthRefreshFailed,
    OauthTokenExpired,
    WebhookNotConfigured,
    WebhookValidationFailed,
    WebhookVerificationFailed,
    EncryptFailed,
    DecryptFailed,
    EncryptionSecretRequired,
    BuildConfigRequired,
    BuildScopesRequired,
    BuildConnectorsRequired,
    ValidationFailed,
    Cancelled,
}

impl Code {
    /// The wire string used in telemetry and in `igniter.connectors.error.occurred`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::ConnectorNotFound => "CONNECTOR_NOT_FOUND",
            Code::ConnectorNotConnected => "CONNECTOR_NOT_CONNECTED",
            Code::ConnectorAlreadyConnected => "CONNECTOR_ALREADY_CONNECTED",
            Code::ConnectorConfigInvalid => "CONNECTOR_CONFIG_INVALID",
            Code::ConnectorDefaultConfigRequired => "CONNECTOR_DEFAULT_CONFIG_REQUIRED",
            Code::ActionNotFound => "ACTION_NOT_FOUND",
            Code::ActionInputInvalid => "ACTION_INPUT_INVALID",
            Code::ActionOutputInvalid => "ACTION_OUTPUT_INVALID",
            Code::ActionFailed => "ACTION_FAILED",
            Code::ScopeInvalid => "SCOPE_INVALID",
            Code::ScopeIdentifierRequired => "SCOPE_IDENTIFIER_REQUIRED",
            Code::DatabaseRequired => "DATABASE_REQUIRED",
            Code::DatabaseFailed => "DATABASE_FAILED",
            Code::OauthNotConfigured => "OAUTH_NOT_CONFIGURED",
            Code::OauthStateInvalid => "OAUTH_STATE_INVALID",
            Code::OauthTokenFailed => "OAUTH_TOKEN_FAILED",
            Code::OauthParseTokenFailed => "OAUTH_PARSE_TOKEN_FAILED",
            Code::OauthParseUserinfoFailed => "OAUTH_PARSE_USERINFO_FAILED",
            Code::OauthRefreshFailed => "OAUTH_REFRESH_FAILED",
            Code::OauthTokenExpired => "OAUTH_TOKEN_EXPIRED",
            Code::WebhookNotConfigured => "WEBHOOK_NOT_CONFIGURED",
            Code::WebhookValidationFailed => "WEBHOOK_VALIDATION_FAILED",
            Code::WebhookVerificationFailed => "WEBHOOK_VERIFICATION_FAILED",
            Code::EncryptFailed => "ENCRYPT_FAILED",
            Code::DecryptFailed => "DECRYPT_FAILED",
            Code::EncryptionSecretRequired => "ENCRYPTION_SECRET_REQUIRED",
            Code::BuildConfigRequired => "BUILD_CONFIG_REQUIRED",
            Code::BuildScopesRequired => "BUILD_SCOPES_REQUIRED",
            Code::BuildConnectorsRequired => "BUILD_CONNECTORS_REQUIRED",
            Code::ValidationFailed => "VALIDATION_FAILED",
            Code::Cancelled => "CANCELLED",
        }
    }
}

/// A single `{path, message}` schema validation issue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// The crate's error type. One variant per stable code; `code()` recovers
/// the stable [`Code`] for telemetry and HTTP mapping.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connector '{0}' not found")]
    ConnectorNotFound(String),

    #[error("connector '{connector}' is not connected for this scope")]
    ConnectorNotConnected { connector: String },

    #[error("connector '{connector}' is already connected for this scope")]
    ConnectorAlreadyConnected { connector: String },

    #[error("connector config invalid: {issues:?}")]
    ConnectorConfigInvalid { issues: Vec<ValidationIssue> },

    #[error("connector '{0}' has no default config and cannot be invoked unscoped")]
    ConnectorDefaultConfigRequired(String),

    #[error("action '{action}' not found on connector '{connector}'")]
    ActionNotFound { connector: String, action: String },

    #[error("action input invalid: {issues:?}")]
    ActionInputInvalid { issues: Vec<ValidationIssue> },

    #[error("action output invalid: {issues:?}")]
    ActionOutputInvalid { issues: Vec<ValidationIssue> },

    #[error("action '{action}' on connector '{connector}' failed: {message}")]
    ActionFailed { connector: String, action: String, message: String },

    #[error("scope '{0}' is not registered")]
    ScopeInvalid(String),

    #[error("scope '{0}' requires an identity")]
    ScopeIdentifierRequired(String),

    #[error("a storage adapter is required")]
    DatabaseRequired,

    #[error("storage adapter operation failed: {0}")]
    DatabaseFailed(String),

    #[error("connector '{0}' has no oauth configuration")]
    OauthNotConfigured(String),

    #[error("oauth state is missing, expired, or already consumed: {0}")]
    OauthStateInvalid(String),

    #[error("oauth token exchange failed: {0}")]
    OauthTokenFailed(String),

    #[error("could not parse access token out of the token endpoint response")]
    OauthParseTokenFailed,

    #[error("could not parse user info response")]
    OauthParseUserinfoFailed,

    #[error("oauth refresh failed: {0}")]
    OauthRefreshFailed(String),

    #[error("oauth token expired and cannot be refreshed")]
    OauthTokenExpired,

    #[error("connector '{0}' has no webhook configuration")]
    WebhookNotConfigured(String),

    #[error("webhook payload failed schema validation: {issues:?}")]
    WebhookValidationFailed { issues: Vec<ValidationIssue> },

    #[error("webhook signature verification failed")]
    WebhookVerificationFailed,

    #[error("field encryption failed: {0}")]
    EncryptFailed(String),

    #[error("field decryption failed: {0}")]
    DecryptFailed(String),

    #[error("an encryption secret is required (set IGNITER_SECRET or supply custom encrypt/decrypt)")]
    EncryptionSecretRequired,

    #[error("registry build requires a storage adapter")]
    BuildConfigRequired,

    #[error("registry build requires at least one scope")]
    BuildScopesRequired,

    #[error("registry build requires at least one connector")]
    BuildConnectorsRequired,

    #[error("validation failed: {issues:?}")]
    ValidationFailed { issues: Vec<ValidationIssue> },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// The stable code for this error, used in telemetry and HTTP responses.
    pub fn code(&self) -> Code {
        match self {
            Error::ConnectorNotFound(_) => Code::ConnectorNotFound,
            Error::ConnectorNotConnected { .. } => Code::ConnectorNotConnected,
            Error::ConnectorAlreadyConnected { .. } => Code::ConnectorAlreadyConnected,
            Error::ConnectorConfigInvalid { .. } => Code::ConnectorConfigInvalid,
            Error::ConnectorDefaultConfigRequired(_) => Code::ConnectorDefaultConfigRequired,
            Error::ActionNotFound { .. } => Code::ActionNotFound,
            Error::ActionInputInvalid { .. } => Code::ActionInputInvalid,
            Error::ActionOutputInvalid { .. } => Code::ActionOutputInvalid,
            Error::ActionFailed { .. } => Code::ActionFailed,
            Error::ScopeInvalid(_) => Code::ScopeInvalid,
            Error::ScopeIdentifierRequired(_) => Code::ScopeIdentifierRequired,
            Error::DatabaseRequired => Code::DatabaseRequired,
            Error::DatabaseFailed(_) => Code::DatabaseFailed,
            Error::OauthNotConfigured(_) => Code::OauthNotConfigured,
            Error::OauthStateInvalid(_) => Code::OauthStateInvalid,
            Error::OauthTokenFailed(_) => Code::OauthTokenFailed,
            Error::OauthParseTokenFailed => Code::OauthParseTokenFailed,
            Error::OauthParseUserinfoFailed => Code::OauthParseUserinfoFailed,
            Error::OauthRefreshFailed(_) => Code::OauthRefreshFailed,
            Error::OauthTokenExpired => Code::OauthTokenExpired,
            Error::WebhookNotConfigured(_) => Code::WebhookNotConfigured,
            Error::WebhookValidationFailed { .. } => Code::WebhookValidationFailed,
            Error::WebhookVerificationFailed => Code::WebhookVerificationFailed,
            Error::EncryptFailed(_) => Code::EncryptFailed,
            Error::DecryptFailed(_) => Code::DecryptFailed,
            Error::EncryptionSecretRequired => Code::EncryptionSecretRequired,
            Error::BuildConfigRequired => Code::BuildConfigRequired,
            Error::BuildScopesRequired => Code::BuildScopesRequired,
            Error::BuildConnectorsRequired => Code::BuildConnectorsRequired,
            Error::ValidationFailed { .. } => Code::ValidationFailed,
            Error::Cancelled => Code::Cancelled,
        }
    }

    /// The HTTP status this error should surface as, when flattened onto
    /// the wire by `Manager::handle`.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::ConnectorNotFound(_)
            | Error::ActionNotFound { .. } => StatusCode::NOT_FOUND,
            Error::ConnectorNotConnected { .. }
            | Error::ConnectorConfigInvalid { .. }
            | Error::ConnectorDefaultConfigRequired(_)
            | Error::ActionInputInvalid { .. }
            | Error::ScopeInvalid(_)
            | Error::ScopeIdentifierRequired(_)
            | Error::OauthNotConfigured(_)
            | Error::OauthStateInvalid(_)
            | Error::WebhookNotConfigured(_)
            | Error::WebhookValidationFailed { .. }
            | Error::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            Error::ConnectorAlreadyConnected { .. } => StatusCode::CONFLICT,
            Error::WebhookVerificationFailed => StatusCode::UNAUTHORIZED,
            Error::OauthTokenExpired => StatusCode::UNAUTHORIZED,
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Error::ActionOutputInvalid { .. }
            | Error::ActionFailed { .. }
            | Error::DatabaseRequired
            | Error::DatabaseFailed(_)
            | Error::OauthTokenFailed(_)
            | Error::OauthParseTokenFailed
            | Error::OauthParseUserinfoFailed
            | Error::OauthRefreshFailed(_)
            | Error::EncryptFailed(_)
            | Error::DecryptFailed(_)
            | Error::EncryptionSecretRequired
            | Error::BuildConfigRequired
            | Error::BuildScopesRequired
            | Error::BuildConnectorsRequired => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
