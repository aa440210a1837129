//! OAuth engine: one instance per connector-with-OAuth, cached by the
//! registry. Owns authorization-URL generation (CSRF state + PKCE), a
//! time-bounded single-use pending-state store, code-for-token exchange,
//! refresh, user-info fetch and expiry checks.
//!
//! The state machine is linear and has no retries of its own:
//! `generate_auth_url` → awaiting callback (stored, TTL 10m) →
//! `exchange_code_for_token` → tokened → persisted, or failed on an
//! invalid/expired state. Nothing here drives that machine across calls;
//! each method is a single transition, with no internal state carried
//! between them beyond the pending-state map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_builder::Builder;
use junction_macros::ToQueryString;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const STATE_TTL: Duration = Duration::from_secs(600);
const DEFAULT_EXPIRY_BUFFER_SECS: i64 = 60;

/// The fixed authorize-URL parameters. `extra_auth_params` is a
/// host-supplied `HashMap` and stays outside this struct — `ToQueryString`
/// only knows named fields — and is appended after `to_query_string()`.
#[derive(ToQueryString)]
struct AuthorizeParams {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    state: String,
    scope: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

/// Token-exchange/refresh body: `grant_type=authorization_code`
/// plus `code`, `client_id`, `redirect_uri`, optional `client_secret` and
/// `code_verifier` (PKCE).
#[derive(ToQueryString)]
struct TokenExchangeParams {
    grant_type: String,
    code: String,
    client_id: String,
    redirect_uri: String,
    client_secret: Option<String>,
    code_verifier: Option<String>,
}

/// Normalized OAuth tokens plus optional user info, stored inside a
/// connector record's `value.oauth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub user_info: Option<UserInfo>,
    pub connected_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
}

/// State recorded between `generate_auth_url` and the callback.
#[derive(Debug, Clone)]
pub struct PendingOAuthState {
    pub scope: String,
    pub identity: String,
    pub connector: String,
    pub code_verifier: Option<String>,
    pub created_at: Instant,
    pub custom_data: Option<Value>,
}

impl PendingOAuthState {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= STATE_TTL
    }
}

/// The authorization-URL-plus-state returned by [`OAuthEngine::generate_auth_url`].
pub struct AuthUrl {
    pub url: String,
    pub state: String,
}

/// Per-connector OAuth configuration. Built once at registration
/// time and held by the [`OAuthEngine`] for that connector.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct OAuthConfig {
    pub authorization_url: String,
    pub token_url: String,
    #[builder(default)]
    pub user_info_url: Option<String>,
    pub client_id: String,
    #[builder(default)]
    pub client_secret: Option<String>,
    #[builder(default)]
    pub scopes: Vec<String>,
    #[builder(default = "true")]
    pub pkce: bool,
    #[builder(default)]
    pub extra_auth_params: HashMap<String, String>,
    pub redirect_uri: String,
}

/// One instance per connector-with-OAuth. Owns the pending-state map, which
/// does not outlive this engine and is never shared across connector keys.
pub struct OAuthEngine {
    config: OAuthConfig,
    http: ClientWithMiddleware,
    pending: Mutex<HashMap<String, PendingOAuthState>>,
}

impl OAuthEngine {
    pub fn new(config: OAuthConfig, http: ClientWithMiddleware) -> Self {
        Self { config, http, pending: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// `generateAuthUrl`: issues a fresh 32-char alphanumeric state token
    /// (and, if PKCE is enabled, a verifier/challenge pair), stores the
    /// pending state, and returns the fully-built authorization URL.
    pub async fn generate_auth_url(
        &self,
        scope: &str,
        identity: &str,
        custom_data: Option<Value>,
    ) -> Result<AuthUrl> {
        let state = random_alphanumeric(32);
        let code_verifier = if self.config.pkce { Some(random_code_verifier(64)) } else { None };

        let params = AuthorizeParams {
            response_type: "code".to_string(),
            client_id: self.config.client_id.clone(),
            redirect_uri: self.config.redirect_uri.clone(),
            state: state.clone(),
            scope: (!self.config.scopes.is_empty()).then(|| self.config.scopes.join(" ")),
            code_challenge: code_verifier.as_deref().map(pkce_challenge),
            code_challenge_method: code_verifier.as_ref().map(|_| "S256".to_string()),
        };

        let mut query = params.to_query_string();
        for (k, v) in &self.config.extra_auth_params {
            let encoded = utf8_percent_encode(v, NON_ALPHANUMERIC);
            query.push_str(&format!("&{k}={encoded}"));
        }

        let url = format!("{}{}", self.config.authorization_url, query);

        self.pending.lock().await.insert(
            state.clone(),
            PendingOAuthState {
                scope: scope.to_string(),
                identity: identity.to_string(),
                connector: String::new(),
                code_verifier,
                created_at: Instant::now(),
                custom_data,
            },
        );

        Ok(AuthUrl { url, state })
    }

    /// `validateState`: atomic check-and-remove. A state is valid iff
    /// present, within TTL, and not previously consumed.
    pub async fn validate_state(&self, state: &str) -> Result<PendingOAuthState> {
        let mut pending = self.pending.lock().await;
        match pending.remove(state) {
            Some(entry) if !entry.is_expired() => Ok(entry),
            _ => Err(Error::OauthStateInvalid(state.to_string())),
        }
    }

    /// A periodic sweep a host may call to reclaim expired pending states;
    /// correctness never depends on it since `validate_state` rejects
    /// expired entries regardless. Not self-spawning — the host drives the
    /// cadence, e.g. from its own scheduler.
    pub async fn sweep_expired_states(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, v| !v.is_expired());
        before - pending.len()
    }

    /// `exchangeCodeForToken`: POST to `tokenUrl`, `application/x-www-form-urlencoded`.
    pub async fn exchange_code_for_token(&self, code: &str, code_verifier: Option<&str>) -> Result<OAuthData> {
        let params = TokenExchangeParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            client_id: self.config.client_id.clone(),
            redirect_uri: self.config.redirect_uri.clone(),
            client_secret: self.config.client_secret.clone(),
            code_verifier: code_verifier.map(str::to_string),
        };
        let body = params.to_query_string();

        let response = self
            .http
            .post(&self.config.token_url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body[1..].to_string())
            .send()
            .await
            .map_err(|e| Error::OauthTokenFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OauthTokenFailed(format!("token endpoint returned {status}: {body}")));
        }

        let body: Value = response.json().await.map_err(|e| Error::OauthTokenFailed(e.to_string()))?;
        parse_token_response(&body, None)
    }

    /// `refresh`: same shape with `grant_type=refresh_token`. If the
    /// provider omits a refresh token, the existing one is preserved.
    pub async fn refresh(&self, existing: &OAuthData) -> Result<OAuthData> {
        let refresh_token = existing.refresh_token.as_ref().ok_or(Error::OauthTokenExpired)?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret));
        }

        let response =
            self.http.post(&self.config.token_url).form(&form).send().await.map_err(|e| Error::OauthRefreshFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OauthRefreshFailed(format!("token endpoint returned {status}: {body}")));
        }

        let body: Value = response.json().await.map_err(|e| Error::OauthRefreshFailed(e.to_string()))?;
        let mut tokens = parse_token_response(&body, None).map_err(|e| Error::OauthRefreshFailed(e.to_string()))?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = existing.refresh_token.clone();
        }
        tokens.user_info = existing.user_info.clone();
        Ok(tokens)
    }

    /// `completeOAuthData`: optional enrichment via `userInfoUrl`.
    pub async fn user_info(&self, access_token: &str) -> Result<Option<UserInfo>> {
        let Some(url) = &self.config.user_info_url else { return Ok(None) };

        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|_| Error::OauthParseUserinfoFailed)?;

        if !response.status().is_success() {
            return Err(Error::OauthParseUserinfoFailed);
        }

        let body: Value = response.json().await.map_err(|_| Error::OauthParseUserinfoFailed)?;
        Ok(Some(parse_user_info(&body)))
    }
}

/// `isExpired(tokens, bufferSec=60)`. Tokens with neither `expiresAt` nor
/// `expiresIn` set are treated as non-expiring.
pub fn is_expired(tokens: &OAuthData, now: i64, buffer_sec: i64) -> bool {
    match tokens.expires_at {
        Some(expires_at) => expires_at - buffer_sec <= now,
        None => false,
    }
}

/// [`is_expired`] with the default 60-second buffer.
pub fn is_expired_default(tokens: &OAuthData, now: i64) -> bool {
    is_expired(tokens, now, DEFAULT_EXPIRY_BUFFER_SECS)
}

fn parse_token_response(body: &Value, custom: Option<&dyn Fn(&Value) -> Option<Value>>) -> Result<OAuthData> {
    if let Some(f) = custom {
        if let Some(v) = f(body) {
            return serde_json::from_value(v).map_err(|_| Error::OauthParseTokenFailed);
        }
    }

    let access_token = first_string(body, &["access_token", "accessToken", "token"]).ok_or(Error::OauthParseTokenFailed)?;
    let refresh_token = first_string(body, &["refresh_token", "refreshToken"]);
    let token_type = first_string(body, &["token_type", "tokenType"]);
    let expires_in = first_number(body, &["expires_in", "expiresIn", "expires"]);
    let now = chrono::Utc::now().timestamp();
    let expires_at = expires_in.map(|secs| now + secs);

    Ok(OAuthData { access_token, refresh_token, expires_at, expires_in, token_type, user_info: None, connected_at: now })
}

fn parse_user_info(body: &Value) -> UserInfo {
    UserInfo {
        id: first_string(body, &["id", "sub", "user_id", "userId", "uid"]),
        name: first_string(body, &["name", "displayName", "display_name", "username", "full_name", "fullName"]),
        email: first_string(body, &["email", "emailAddress", "email_address", "mail"]),
        avatar: first_string(body, &["avatar", "picture", "avatar_url", "photo", "image", "profile_image"]),
    }
}

fn first_string(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| body.get(k).and_then(Value::as_str).map(str::to_string))
}

fn first_number(body: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| body.get(k).and_then(Value::as_i64))
}

fn random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

/// PKCE verifier: 64 chars from the unreserved set `[A-Za-z0-9-._~]`.
fn random_code_verifier(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

fn pkce_challenge(verifier: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OAuthConfig {
        OAuthConfigBuilder::default()
            .authorization_url("https://provider.example/authorize".to_string())
            .token_url("https://provider.example/token".to_string())
            .user_info_url(Some("https://provider.example/userinfo".to_string()))
            .client_id("CID".to_string())
            .client_secret(Some("CSECRET".to_string()))
            .scopes(vec!["read".to_string(), "write".to_string()])
            .redirect_uri("https://host.example/connectors/mailchimp/oauth/callback".to_string())
            .build()
            .unwrap()
    }

    fn engine() -> OAuthEngine {
        OAuthEngine::new(config(), reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build())
    }

    #[tokio::test]
    async fn generate_auth_url_includes_pkce_and_scope() {
        let engine = engine();
        let auth = engine.generate_auth_url("org", "org_1", None).await.unwrap();
        assert!(auth.url.contains("response_type=code"));
        assert!(auth.url.contains("client_id=CID"));
        assert!(auth.url.contains("scope=read+write") || auth.url.contains("scope=read%20write"));
        assert!(auth.url.contains("code_challenge_method=S256"));
        assert_eq!(auth.state.len(), 32);
    }

    #[tokio::test]
    async fn validate_state_is_single_use() {
        let engine = engine();
        let auth = engine.generate_auth_url("org", "org_1", None).await.unwrap();
        let pending = engine.validate_state(&auth.state).await.unwrap();
        assert_eq!(pending.scope, "org");
        assert_eq!(pending.identity, "org_1");

        let second = engine.validate_state(&auth.state).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn unknown_state_is_invalid() {
        let engine = engine();
        assert!(engine.validate_state("not-a-real-state").await.is_err());
    }

    #[test]
    fn parses_snake_case_token_response() {
        let body = serde_json::json!({
            "access_token": "AT",
            "refresh_token": "RT",
            "expires_in": 3600,
            "token_type": "Bearer",
        });
        let tokens = parse_token_response(&body, None).unwrap();
        assert_eq!(tokens.access_token, "AT");
        assert_eq!(tokens.refresh_token.as_deref(), Some("RT"));
        assert_eq!(tokens.expires_in, Some(3600));
        assert!(tokens.expires_at.is_some());
    }

    #[test]
    fn parses_camel_case_token_response() {
        let body = serde_json::json!({ "accessToken": "AT2", "expiresIn": 120 });
        let tokens = parse_token_response(&body, None).unwrap();
        assert_eq!(tokens.access_token, "AT2");
    }

    #[test]
    fn missing_access_token_fails() {
        let body = serde_json::json!({ "refresh_token": "RT" });
        assert!(parse_token_response(&body, None).is_err());
    }

    #[test]
    fn expiry_check_respects_buffer() {
        let now = chrono::Utc::now().timestamp();
        let tokens = OAuthData {
            access_token: "AT".into(),
            refresh_token: None,
            expires_at: Some(now + 30),
            expires_in: Some(30),
            token_type: None,
            user_info: None,
            connected_at: now,
        };
        assert!(is_expired(&tokens, now, 60));
        assert!(!is_expired(&tokens, now, 5));
    }

    #[test]
    fn non_expiring_tokens_are_never_expired() {
        let now = chrono::Utc::now().timestamp();
        let tokens = OAuthData {
            access_token: "AT".into(),
            refresh_token: None,
            expires_at: None,
            expires_in: None,
            token_type: None,
            user_info: None,
            connected_at: now,
        };
        assert!(!is_expired(&tokens, now, 60));
    }

    #[test]
    fn parses_user_info_variants() {
        let body = serde_json::json!({"sub": "u1", "email": "a@b"});
        let info = parse_user_info(&body);
        assert_eq!(info.id.as_deref(), Some("u1"));
        assert_eq!(info.email.as_deref(), Some("a@b"));
    }
}
