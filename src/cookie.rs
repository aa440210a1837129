//! OAuth callback cookie encode/decode.
//!
//! The cookie carries `{scope, identity, redirectUrl, state}` so the
//! callback can recover the original authorize-leg context without
//! server-side session storage. A pragmatic but trust-the-browser choice, so
//! the value is signed with the same secret used for [`crate::crypto::Crypto`]
//! — this module derives its HMAC-SHA256 key the same way [`crate::crypto`]
//! derives its AEAD key: SHA-256 the process-wide secret down to a fixed
//! length.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The cookie's decoded payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthCookiePayload {
    pub scope: String,
    pub identity: String,
    pub redirect_url: String,
    pub state: String,
}

/// Encodes/decodes the `igniter_oauth_<connector>` cookie value, signing it
/// with the same secret [`crate::crypto::Crypto::builtin`] derives its key
/// from.
pub struct CookieSigner {
    key: Vec<u8>,
}

impl CookieSigner {
    pub fn new(secret: impl AsRef<str>) -> Self {
        use sha2::Digest;
        let digest = Sha256::digest(secret.as_ref().as_bytes());
        Self { key: digest.to_vec() }
    }

    /// `urlencode(JSON(payload))` plus a detached HMAC-SHA256 signature,
    /// joined by `.`: `<base64url(json)>.<base64url(hmac)>`.
    pub fn encode(&self, payload: &OAuthCookiePayload) -> String {
        let json = serde_json::to_vec(payload).expect("OAuthCookiePayload always serializes");
        let body = URL_SAFE_NO_PAD.encode(&json);
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{body}.{signature}")
    }

    /// Verifies the signature and decodes the payload. Returns `None` on any
    /// parse or verification failure — the caller falls back to
    /// `scope="default"`, `identity=""`, `redirectUrl="/"`.
    pub fn decode(&self, raw: &str) -> Option<OAuthCookiePayload> {
        let (body, signature) = raw.split_once('.')?;

        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(body.as_bytes());
        let expected = URL_SAFE_NO_PAD.decode(signature).ok()?;
        mac.verify_slice(&expected).ok()?;

        let json = URL_SAFE_NO_PAD.decode(body).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> CookieSigner {
        CookieSigner::new("12345678901234567890123456789012")
    }

    fn payload() -> OAuthCookiePayload {
        OAuthCookiePayload {
            scope: "organization".into(),
            identity: "org_1".into(),
            redirect_url: "/dashboard".into(),
            state: "abc123".into(),
        }
    }

    #[test]
    fn round_trips() {
        let signer = signer();
        let encoded = signer.encode(&payload());
        let decoded = signer.decode(&encoded).unwrap();
        assert_eq!(decoded, payload());
    }

    #[test]
    fn rejects_tampered_payload() {
        let signer = signer();
        let encoded = signer.encode(&payload());
        let (body, signature) = encoded.split_once('.').unwrap();
        let tampered_payload = OAuthCookiePayload { identity: "org_evil".into(), ..payload() };
        let tampered_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&tampered_payload).unwrap());
        let tampered = format!("{tampered_body}.{signature}");
        assert_ne!(body, tampered_body);
        assert!(signer.decode(&tampered).is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(signer().decode("not-a-valid-cookie").is_none());
        assert!(signer().decode("abc.def").is_none());
    }

    #[test]
    fn different_secrets_do_not_cross_verify() {
        let encoded = signer().encode(&payload());
        let other = CookieSigner::new("different-secret-different-secret");
        assert!(other.decode(&encoded).is_none());
    }
}
