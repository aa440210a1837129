//! At-rest field encryption.
//!
//! The wire ciphertext format is three base64url segments joined by `:` —
//! `iv:tag:ciphertext` — produced by AES-256-GCM. The IV is 12 bytes, the tag
//! 16. Key derivation hashes whatever the process-wide secret is (any
//! length) down to 32 bytes with SHA-256. The tag is kept detached from the
//! ciphertext rather than concatenated, so the three-segment format stays
//! stable across any future change to how the ciphertext itself is framed.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A pluggable encrypt/decrypt pair. The built-in implementation is
/// [`BuiltinCrypto`]; hosts may supply their own (e.g. backed by a KMS) via
/// [`Crypto::custom`]. When a custom pair is supplied the crate never derives
/// or touches the built-in key.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// The crate's encryption façade. Wraps either the built-in AEAD
/// implementation or a host-supplied pair, and owns the field-level
/// `encrypt_config`/`decrypt_config` helpers used by the registry.
#[derive(Clone)]
pub struct Crypto {
    provider: Arc<dyn CryptoProvider>,
}

impl Crypto {
    /// Build the built-in AES-256-GCM provider from a process-wide secret.
    /// The secret is padded/truncated to 32 bytes via SHA-256, so any
    /// non-empty string is accepted.
    pub fn builtin(secret: impl AsRef<str>) -> Result<Self> {
        Ok(Self { provider: Arc::new(BuiltinCrypto::new(secret.as_ref())) })
    }

    /// Use a host-supplied encrypt/decrypt pair instead of the built-in key.
    pub fn custom(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    pub fn encrypt(&self, plain: &str) -> Result<String> {
        self.provider.encrypt(plain)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        self.provider.decrypt(ciphertext)
    }

    /// `isEncrypted`: accepts only strings that look like exactly three
    /// base64url segments joined by `:`. This is a format check, not a
    /// cryptographic one — it's deliberately cheap so it can gate every
    /// field on every read/write without decrypting.
    pub fn is_encrypted(s: &str) -> bool {
        let parts: Vec<&str> = s.split(':').collect();
        parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && is_base64url(p))
    }

    /// Encrypt every field named in `fields` that is present in `config`,
    /// is a string, and is not already recognized as ciphertext.
    pub fn encrypt_config(&self, config: &mut HashMap<String, Value>, fields: &[String]) -> Result<()> {
        for field in fields {
            if let Some(Value::String(s)) = config.get(field) {
                if !Self::is_encrypted(s) {
                    let encrypted = self.encrypt(s)?;
                    config.insert(field.clone(), Value::String(encrypted));
                }
            }
        }
        Ok(())
    }

    /// Symmetric to [`encrypt_config`](Self::encrypt_config): decrypt every
    /// field named in `fields` that is present, a string, and recognized as
    /// ciphertext. Fields that are present but not ciphertext (e.g. never
    /// encrypted, or already plaintext from a caller-supplied provider's
    /// round trip) are left untouched.
    pub fn decrypt_config(&self, config: &mut HashMap<String, Value>, fields: &[String]) -> Result<()> {
        for field in fields {
            if let Some(Value::String(s)) = config.get(field) {
                if Self::is_encrypted(s) {
                    let plain = self.decrypt(s)?;
                    config.insert(field.clone(), Value::String(plain));
                }
            }
        }
        Ok(())
    }

    /// `value.oauth.{access_token,refresh_token}` aren't named in a
    /// connector's `encrypted_fields` policy — they're nested inside the
    /// `oauth` object, not top-level config strings — but they still need to
    /// be encrypted at rest just the same. Call alongside
    /// `encrypt_config`/`decrypt_config` everywhere an `oauth` object is
    /// persisted or read back.
    pub fn encrypt_oauth_tokens(&self, config: &mut HashMap<String, Value>) -> Result<()> {
        if let Some(Value::Object(oauth)) = config.get_mut("oauth") {
            for field in ["access_token", "refresh_token"] {
                if let Some(Value::String(s)) = oauth.get(field).cloned() {
                    if !Self::is_encrypted(&s) {
                        let encrypted = self.encrypt(&s)?;
                        oauth.insert(field.to_string(), Value::String(encrypted));
                    }
                }
            }
        }
        Ok(())
    }

    /// Symmetric to [`encrypt_oauth_tokens`](Self::encrypt_oauth_tokens).
    pub fn decrypt_oauth_tokens(&self, config: &mut HashMap<String, Value>) -> Result<()> {
        if let Some(Value::Object(oauth)) = config.get_mut("oauth") {
            for field in ["access_token", "refresh_token"] {
                if let Some(Value::String(s)) = oauth.get(field).cloned() {
                    if Self::is_encrypted(&s) {
                        let plain = self.decrypt(&s)?;
                        oauth.insert(field.to_string(), Value::String(plain));
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_base64url(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// The built-in AEAD provider: AES-256-GCM with a key derived from a
/// process-wide secret.
struct BuiltinCrypto {
    key: Key<Aes256Gcm>,
}

impl BuiltinCrypto {
    fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self { key: *Key::<Aes256Gcm>::from_slice(&digest) }
    }
}

impl CryptoProvider for BuiltinCrypto {
    fn encrypt(&self, plain: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // `encrypt` returns ciphertext with the tag appended; the wire
        // format wants the tag as its own segment, so split it back out.
        let mut sealed = cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|e| Error::EncryptFailed(e.to_string()))?;
        if sealed.len() < 16 {
            return Err(Error::EncryptFailed("ciphertext shorter than auth tag".into()));
        }
        let tag = sealed.split_off(sealed.len() - 16);

        Ok(format!(
            "{}:{}:{}",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(tag),
            URL_SAFE_NO_PAD.encode(sealed),
        ))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let parts: Vec<&str> = ciphertext.split(':').collect();
        let [iv_b64, tag_b64, ct_b64] = <[&str; 3]>::try_from(parts)
            .map_err(|_| Error::DecryptFailed("malformed ciphertext: expected iv:tag:ciphertext".into()))?;

        let iv = URL_SAFE_NO_PAD
            .decode(iv_b64)
            .map_err(|e| Error::DecryptFailed(format!("bad iv: {e}")))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|e| Error::DecryptFailed(format!("bad tag: {e}")))?;
        let ct = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|e| Error::DecryptFailed(format!("bad ciphertext: {e}")))?;

        if iv.len() != 12 {
            return Err(Error::DecryptFailed("iv must be 12 bytes".into()));
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Nonce::from_slice(&iv);
        let plain = cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| Error::DecryptFailed("authentication tag mismatch".into()))?;

        String::from_utf8(plain).map_err(|e| Error::DecryptFailed(format!("decrypted value not utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> Crypto {
        Crypto::builtin("12345678901234567890123456789012").unwrap()
    }

    #[test]
    fn round_trips() {
        let c = crypto();
        let ct = c.encrypt("xoxb-AAA").unwrap();
        assert!(Crypto::is_encrypted(&ct));
        assert_eq!(c.decrypt(&ct).unwrap(), "xoxb-AAA");
    }

    #[test]
    fn ciphertexts_are_nondeterministic() {
        let c = crypto();
        let a = c.encrypt("same-plaintext").unwrap();
        let b = c.encrypt("same-plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a).unwrap(), c.decrypt(&b).unwrap());
    }

    #[test]
    fn is_encrypted_rejects_plaintext() {
        assert!(!Crypto::is_encrypted("xoxb-AAA"));
        assert!(!Crypto::is_encrypted("a:b"));
        assert!(!Crypto::is_encrypted("a:b:c:d"));
    }

    #[test]
    fn tampered_tag_fails_to_decrypt() {
        let c = crypto();
        let ct = c.encrypt("secret").unwrap();
        let mut parts: Vec<String> = ct.split(':').map(String::from).collect();
        parts[1] = "AAAAAAAAAAAAAAAAAAAAAA".to_string();
        let tampered = parts.join(":");
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn encrypt_config_skips_already_encrypted_fields() {
        let c = crypto();
        let mut cfg = HashMap::new();
        let ct = c.encrypt("xoxb-AAA").unwrap();
        cfg.insert("apiKey".to_string(), Value::String(ct.clone()));
        cfg.insert("channel".to_string(), Value::String("#ops".to_string()));

        c.encrypt_config(&mut cfg, &["apiKey".to_string(), "channel".to_string()]).unwrap();

        // apiKey was already ciphertext, so re-encrypting would double-wrap it;
        // instead it's left alone.
        assert_eq!(cfg.get("apiKey").unwrap().as_str().unwrap(), ct);
        // channel was plaintext and is in the policy, so it gets encrypted.
        assert!(Crypto::is_encrypted(cfg.get("channel").unwrap().as_str().unwrap()));
    }
}
