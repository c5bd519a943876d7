//! Token issuance and verification.

use crate::error::{TokenError, TokenResult};
use crate::signer::KeySigner;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use prost::Message;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use trellis_proto::{Capability, SignedToken, TokenBody, TokenCapability, TokenRole};
use uuid::Uuid;

/// What to put in a freshly minted token.
#[derive(Clone, Debug)]
pub struct TokenSpec {
    pub role: TokenRole,
    pub account_id: Option<Uuid>,
    pub namespace: Option<String>,
    pub capabilities: Vec<TokenCapability>,
    pub valid_duration: Option<Duration>,
}

impl Default for TokenSpec {
    fn default() -> Self {
        Self {
            role: TokenRole::Unknown,
            account_id: None,
            namespace: None,
            capabilities: Vec::new(),
            valid_duration: None,
        }
    }
}

impl TokenSpec {
    pub fn hub() -> Self {
        Self {
            role: TokenRole::Hub,
            ..Self::default()
        }
    }

    pub fn manage(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            role: TokenRole::Manage,
            capabilities: vec![TokenCapability {
                capability: Capability::Access as i32,
                value: namespace.clone(),
            }],
            namespace: Some(namespace),
            ..Self::default()
        }
    }
}

/// Mints bearer tokens through an external signing backend.
pub struct TokenIssuer {
    signer: Arc<dyn KeySigner>,
    key_id: String,
}

impl TokenIssuer {
    pub fn new(signer: Arc<dyn KeySigner>, key_id: impl Into<String>) -> Self {
        Self {
            signer,
            key_id: key_id.into(),
        }
    }

    /// Serialize the body deterministically, have the backend sign it,
    /// and wrap the result into a bearer string.
    pub async fn sign(&self, spec: TokenSpec) -> TokenResult<String> {
        let body = TokenBody {
            role: spec.role as i32,
            account_id: spec
                .account_id
                .map(|id| id.as_bytes().to_vec())
                .unwrap_or_default(),
            namespace: spec.namespace.unwrap_or_default(),
            capabilities: spec.capabilities,
            issued_at: OffsetDateTime::now_utc().unix_timestamp(),
            valid_duration_secs: spec
                .valid_duration
                .map(|d| d.whole_seconds())
                .unwrap_or(0),
            token_id: Uuid::new_v4().as_bytes().to_vec(),
        };

        let body_bytes = body.encode_to_vec();
        let signature = self.signer.sign(&self.key_id, &body_bytes).await?;

        let envelope = SignedToken {
            body: body_bytes,
            signature,
        };
        Ok(URL_SAFE_NO_PAD.encode(envelope.encode_to_vec()))
    }
}

/// A verified token.
#[derive(Clone, Debug)]
pub struct ValidToken {
    body: TokenBody,
}

impl ValidToken {
    pub fn role(&self) -> TokenRole {
        self.body.role()
    }

    /// The namespace this token is scoped to, if any.
    pub fn namespace(&self) -> &str {
        &self.body.namespace
    }

    pub fn account_id(&self) -> Option<Uuid> {
        let raw: [u8; 16] = self.body.account_id.as_slice().try_into().ok()?;
        Some(Uuid::from_bytes(raw))
    }

    /// Whether the token's namespace contains `ns`.
    pub fn allow_account(&self, ns: &str) -> bool {
        trellis_core::namespace::contains(&self.body.namespace, ns)
    }

    /// The value of a granted capability, if present.
    pub fn capability(&self, cap: Capability) -> Option<&str> {
        self.body
            .capabilities
            .iter()
            .find(|c| c.capability() == cap)
            .map(|c| c.value.as_str())
    }

    pub fn body(&self) -> &TokenBody {
        &self.body
    }
}

/// Check a bearer string against the signing public key and return the
/// parsed body.
pub fn verify(bearer: &str, public_key: &[u8; 32]) -> TokenResult<ValidToken> {
    let raw = URL_SAFE_NO_PAD
        .decode(bearer)
        .map_err(|e| TokenError::Malformed(format!("invalid base64: {e}")))?;
    let envelope = SignedToken::decode(raw.as_slice())
        .map_err(|e| TokenError::Malformed(format!("invalid envelope: {e}")))?;

    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| TokenError::KeyParsing(format!("invalid public key: {e}")))?;
    let signature: [u8; 64] = envelope
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| TokenError::Malformed("invalid signature length".to_string()))?;
    key.verify(&envelope.body, &Signature::from_bytes(&signature))
        .map_err(|_| TokenError::BadSignature)?;

    let body = TokenBody::decode(envelope.body.as_slice())
        .map_err(|e| TokenError::Malformed(format!("invalid body: {e}")))?;

    if body.valid_duration_secs != 0 {
        let expires_at = body.issued_at + body.valid_duration_secs;
        if OffsetDateTime::now_utc().unix_timestamp() >= expires_at {
            return Err(TokenError::Expired);
        }
    }

    Ok(ValidToken { body })
}
