//! URL builder/parser: constructs and extracts the connector key + secret
//! from webhook and OAuth-callback URLs using the fixed path shape
//! `<base_url><base_path>/connectors/<connector_key>/webhook/<secret>` and
//! `.../connectors/<connector_key>/oauth/callback`.
//!
//! Parsing is regex-anchored rather than a general-purpose URL parser
//! walking path segments — the shape is fixed and a regex makes that fact
//! visible in the code instead of implicit in a segment-counting loop.

use std::env;
use std::sync::OnceLock;

use rand::RngCore;
use regex::Regex;

/// Environment variables consulted for the base URL, in priority order. An
/// explicit value passed to [`BaseUrl::resolve`] always wins over all of
/// these.
const BASE_URL_ENV_PRIORITY: &[&str] = &[
    "IGNITER_BASE_URL",
    "NEXT_PUBLIC_IGNITER_BASE_URL",
    "NEXT_PUBLIC_APP_URL",
    "REACT_APP_BASE_URL",
    "VITE_BASE_URL",
    "BASE_URL",
    "APP_URL",
    "VERCEL_URL",
];

/// Resolves the process-wide base URL once, during registry construction —
/// never read from the environment again at call time.
pub struct BaseUrl {
    value: String,
}

impl BaseUrl {
    /// Resolve the base URL: an explicit value wins, otherwise the first
    /// environment variable in [`BASE_URL_ENV_PRIORITY`] that is set.
    /// Returns `None` if nothing resolves.
    pub fn resolve(explicit: Option<&str>) -> Option<Self> {
        if let Some(v) = explicit {
            return Some(Self { value: v.trim_end_matches('/').to_string() });
        }
        for var in BASE_URL_ENV_PRIORITY {
            if let Ok(v) = env::var(var) {
                if !v.is_empty() {
                    return Some(Self { value: v.trim_end_matches('/').to_string() });
                }
            }
        }
        None
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

/// Builds the fully-qualified webhook URL for a connector's connection.
pub fn webhook_url(base: &str, base_path: &str, connector_key: &str, secret: &str) -> String {
    format!("{base}{base_path}/connectors/{connector_key}/webhook/{secret}")
}

/// Builds the fully-qualified OAuth callback URL for a connector.
pub fn oauth_callback_url(base: &str, base_path: &str, connector_key: &str) -> String {
    format!("{base}{base_path}/connectors/{connector_key}/oauth/callback")
}

fn webhook_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/connectors/([^/]+)/webhook/([^/?#]+)").unwrap())
}

fn oauth_callback_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/connectors/([^/]+)/oauth/callback").unwrap())
}

/// The result of successfully parsing a webhook URL's path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWebhookUrl {
    pub connector_key: String,
    pub secret: String,
}

/// Parse `/connectors/<key>/webhook/<secret>` out of a path or full URL.
/// Returns `None` on any mismatch — no partial matches.
pub fn parse_webhook_url(path_or_url: &str) -> Option<ParsedWebhookUrl> {
    let caps = webhook_regex().captures(path_or_url)?;
    Some(ParsedWebhookUrl {
        connector_key: caps.get(1)?.as_str().to_string(),
        secret: caps.get(2)?.as_str().to_string(),
    })
}

/// The result of successfully parsing an OAuth callback URL's path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOAuthCallbackUrl {
    pub connector_key: String,
}

/// Parse `/connectors/<key>/oauth/callback` out of a path or full URL.
pub fn parse_oauth_callback_url(path_or_url: &str) -> Option<ParsedOAuthCallbackUrl> {
    let caps = oauth_callback_regex().captures(path_or_url)?;
    Some(ParsedOAuthCallbackUrl { connector_key: caps.get(1)?.as_str().to_string() })
}

/// Generate a webhook secret: 32 hex characters from a CSPRNG.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_webhook_url() {
        let parsed = parse_webhook_url("https://host.example/api/connectors/stripe/webhook/abc123").unwrap();
        assert_eq!(parsed.connector_key, "stripe");
        assert_eq!(parsed.secret, "abc123");
    }

    #[test]
    fn parses_oauth_callback_url() {
        let parsed =
            parse_oauth_callback_url("https://host.example/api/connectors/mailchimp/oauth/callback?code=x")
                .unwrap();
        assert_eq!(parsed.connector_key, "mailchimp");
    }

    #[test]
    fn rejects_mismatched_paths() {
        assert!(parse_webhook_url("https://host.example/connectors/stripe/oauth/callback").is_none());
        assert!(parse_oauth_callback_url("https://host.example/connectors/stripe/webhook/abc").is_none());
        assert!(parse_webhook_url("https://host.example/not-a-connector-path").is_none());
    }

    #[test]
    fn secret_is_32_hex_chars() {
        let secret = generate_webhook_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn secrets_are_unique() {
        assert_ne!(generate_webhook_secret(), generate_webhook_secret());
    }

    #[test]
    fn base_url_explicit_wins_over_env() {
        std::env::set_var("BASE_URL", "https://from-env.example");
        let resolved = BaseUrl::resolve(Some("https://explicit.example/")).unwrap();
        assert_eq!(resolved.as_str(), "https://explicit.example");
        std::env::remove_var("BASE_URL");
    }
}
