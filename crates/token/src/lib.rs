//! Capability token signing and verification.
//!
//! Tokens are ed25519-signed envelopes over a deterministically encoded
//! body carrying a role, an optional account, and a capability set. The
//! private half of the signing key lives behind a [`KeySigner`] (normally
//! the Vault transit engine); the public half is fetched once at startup
//! and used locally for verification.

pub mod error;
pub mod signer;
pub mod token;

pub use error::{TokenError, TokenResult};
pub use signer::{KeySigner, LocalKeySigner, VaultTransitSigner};
pub use token::{TokenIssuer, TokenSpec, ValidToken, verify};
