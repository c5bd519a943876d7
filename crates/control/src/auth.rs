//! Request authentication.
//!
//! Every RPC authenticates via a bearer token in request metadata.
//! Register and IssueHubToken compare against the shared register
//! token; everything else verifies a signed capability token and gates
//! on its role. Missing metadata, a malformed bearer, a bad signature,
//! and a wrong role all collapse to the same bad-authentication error.

use crate::error::{ControlError, ControlResult};
use tonic::metadata::MetadataMap;
use trellis_proto::TokenRole;
use trellis_token::ValidToken;

/// Pull the bearer string out of request metadata.
fn bearer(metadata: &MetadataMap) -> ControlResult<&str> {
    metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ControlError::BadAuthentication)
}

/// Check the shared register token.
pub fn check_shared(metadata: &MetadataMap, expected: &str) -> ControlResult<()> {
    if bearer(metadata)? != expected {
        return Err(ControlError::BadAuthentication);
    }
    Ok(())
}

/// Verify the bearer and require the given role.
pub fn check_role(
    metadata: &MetadataMap,
    public_key: &[u8; 32],
    role: TokenRole,
) -> ControlResult<ValidToken> {
    let token = trellis_token::verify(bearer(metadata)?, public_key).map_err(|err| {
        tracing::debug!(error = %err, "token verification failed");
        ControlError::BadAuthentication
    })?;

    if token.role() != role {
        tracing::debug!(role = ?token.role(), "token role mismatch");
        return Err(ControlError::BadAuthentication);
    }

    Ok(token)
}

/// Require a HUB token.
pub fn check_hub(metadata: &MetadataMap, public_key: &[u8; 32]) -> ControlResult<ValidToken> {
    check_role(metadata, public_key, TokenRole::Hub)
}

/// Require a MANAGE token.
pub fn check_mgmt(metadata: &MetadataMap, public_key: &[u8; 32]) -> ControlResult<ValidToken> {
    check_role(metadata, public_key, TokenRole::Manage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_token::{KeySigner, LocalKeySigner, TokenIssuer, TokenSpec};

    fn metadata_with(token: &str) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", token.parse().unwrap());
        metadata
    }

    #[tokio::test]
    async fn shared_token_check() {
        assert!(check_shared(&metadata_with("secret"), "secret").is_ok());
        assert!(matches!(
            check_shared(&metadata_with("wrong"), "secret"),
            Err(ControlError::BadAuthentication)
        ));
        assert!(matches!(
            check_shared(&MetadataMap::new(), "secret"),
            Err(ControlError::BadAuthentication)
        ));
    }

    #[tokio::test]
    async fn role_gating() {
        let signer = Arc::new(LocalKeySigner::generate());
        let public = signer.public_key("k").await.unwrap();
        let issuer = TokenIssuer::new(signer, "k");

        let hub = issuer.sign(TokenSpec::hub()).await.unwrap();
        assert!(check_hub(&metadata_with(&hub), &public).is_ok());
        assert!(matches!(
            check_mgmt(&metadata_with(&hub), &public),
            Err(ControlError::BadAuthentication)
        ));

        let manage = issuer.sign(TokenSpec::manage("/org")).await.unwrap();
        let token = check_mgmt(&metadata_with(&manage), &public).unwrap();
        assert_eq!(token.namespace(), "/org");
    }

    #[tokio::test]
    async fn malformed_bearer_rejected() {
        let signer = LocalKeySigner::generate();
        let public = signer.public_key("k").await.unwrap();
        assert!(matches!(
            check_hub(&metadata_with("garbage"), &public),
            Err(ControlError::BadAuthentication)
        ));
    }
}
