//! Signing backends.
//!
//! The control plane never holds the private signing key itself in
//! production; it asks an external secret manager to sign payloads and
//! fetches the public half once at startup. [`LocalKeySigner`] keeps the
//! key in process for tests and development.

use crate::error::{TokenError, TokenResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer as _, SigningKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Verb-only access to an ed25519 signing key.
#[async_trait]
pub trait KeySigner: Send + Sync {
    /// Sign a payload with the named key.
    async fn sign(&self, key_id: &str, payload: &[u8]) -> TokenResult<Vec<u8>>;

    /// Fetch the public half of the named key.
    async fn public_key(&self, key_id: &str) -> TokenResult<[u8; 32]>;
}

/// In-process signing key.
pub struct LocalKeySigner {
    key: SigningKey,
}

impl LocalKeySigner {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Load from a base64-encoded 32-byte seed.
    pub fn from_seed_base64(s: &str) -> TokenResult<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| TokenError::KeyParsing(format!("invalid base64: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| TokenError::KeyParsing(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// The base64-encoded seed, for persisting a generated key.
    pub fn seed_base64(&self) -> String {
        STANDARD.encode(self.key.as_bytes())
    }
}

impl fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalKeySigner([REDACTED])")
    }
}

#[async_trait]
impl KeySigner for LocalKeySigner {
    async fn sign(&self, _key_id: &str, payload: &[u8]) -> TokenResult<Vec<u8>> {
        Ok(self.key.sign(payload).to_bytes().to_vec())
    }

    async fn public_key(&self, _key_id: &str) -> TokenResult<[u8; 32]> {
        Ok(self.key.verifying_key().to_bytes())
    }
}

/// Vault transit-engine signer.
///
/// Uses the transit sign endpoint, so the private key never leaves Vault.
pub struct VaultTransitSigner {
    http: reqwest::Client,
    addr: String,
    mount: String,
    token: String,
}

#[derive(Deserialize)]
struct SignResponse {
    data: SignData,
}

#[derive(Deserialize)]
struct SignData {
    signature: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    data: KeyData,
}

#[derive(Deserialize)]
struct KeyData {
    latest_version: u64,
    keys: HashMap<String, KeyVersion>,
}

#[derive(Deserialize)]
struct KeyVersion {
    public_key: String,
}

impl VaultTransitSigner {
    pub fn new(addr: impl Into<String>, mount: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.into(),
            mount: mount.into(),
            token: token.into(),
        }
    }

    /// Strip the `vault:vN:` prefix and decode the signature bytes.
    fn decode_signature(raw: &str) -> TokenResult<Vec<u8>> {
        let mut parts = raw.splitn(3, ':');
        let (vault, _version, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(ver), Some(sig)) => (v, ver, sig),
            _ => return Err(TokenError::Upstream(format!("unexpected signature form: {raw}"))),
        };
        if vault != "vault" {
            return Err(TokenError::Upstream(format!("unexpected signature form: {raw}")));
        }
        STANDARD
            .decode(sig)
            .map_err(|e| TokenError::Upstream(format!("invalid signature base64: {e}")))
    }
}

#[async_trait]
impl KeySigner for VaultTransitSigner {
    async fn sign(&self, key_id: &str, payload: &[u8]) -> TokenResult<Vec<u8>> {
        let url = format!("{}/v1/{}/sign/{}", self.addr, self.mount, key_id);
        let resp = self
            .http
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&serde_json::json!({ "input": STANDARD.encode(payload) }))
            .send()
            .await?
            .error_for_status()?;
        let body: SignResponse = resp.json().await?;
        Self::decode_signature(&body.data.signature)
    }

    async fn public_key(&self, key_id: &str) -> TokenResult<[u8; 32]> {
        let url = format!("{}/v1/{}/keys/{}", self.addr, self.mount, key_id);
        let resp = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?
            .error_for_status()?;
        let body: KeyResponse = resp.json().await?;
        let version = body.data.latest_version.to_string();
        let key = body
            .data
            .keys
            .get(&version)
            .ok_or_else(|| TokenError::Upstream(format!("key version {version} missing")))?;
        let bytes = STANDARD
            .decode(&key.public_key)
            .map_err(|e| TokenError::KeyParsing(format!("invalid public key base64: {e}")))?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| TokenError::KeyParsing(format!("expected 32 bytes, got {}", b.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_round_trip() {
        let signer = LocalKeySigner::generate();
        let restored = LocalKeySigner::from_seed_base64(&signer.seed_base64()).unwrap();
        assert_eq!(
            signer.key.verifying_key().to_bytes(),
            restored.key.verifying_key().to_bytes()
        );
    }

    #[test]
    fn rejects_bad_seed() {
        assert!(LocalKeySigner::from_seed_base64("not base64!").is_err());
        assert!(LocalKeySigner::from_seed_base64(&STANDARD.encode([0u8; 16])).is_err());
    }

    #[test]
    fn vault_signature_prefix() {
        let sig = STANDARD.encode([7u8; 64]);
        let decoded = VaultTransitSigner::decode_signature(&format!("vault:v1:{sig}")).unwrap();
        assert_eq!(decoded, vec![7u8; 64]);

        assert!(VaultTransitSigner::decode_signature("v1:abc").is_err());
        assert!(VaultTransitSigner::decode_signature("nonsense").is_err());
    }
}
