//! Wire messages and gRPC service definition for the Trellis control plane.
//!
//! Generated from `proto/control.proto` by tonic-build. The helpers here
//! bridge between the wire representation (opaque 16-byte ids, repeated
//! label messages) and the core domain types.

use thiserror::Error;
use uuid::Uuid;

tonic::include_proto!("trellis");

/// Wire conversion errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid id: expected 16 bytes, got {0}")]
    InvalidId(usize),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Parse a 16-byte opaque id from its wire form.
pub fn parse_id(bytes: &[u8]) -> Result<Uuid, WireError> {
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| WireError::InvalidId(bytes.len()))?;
    Ok(Uuid::from_bytes(raw))
}

/// The wire form of an id.
pub fn id_bytes(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// The fingerprint rendering of an id, used to key session registries
/// and for logging.
pub fn spec_string(bytes: &[u8]) -> Result<String, WireError> {
    Ok(parse_id(bytes)?.hyphenated().to_string())
}

impl Account {
    /// Build an account message from its parts.
    pub fn new(id: Uuid, namespace: impl Into<String>) -> Self {
        Self {
            id: id_bytes(id),
            namespace: namespace.into(),
        }
    }

    /// The account id as a Uuid.
    pub fn key(&self) -> Result<Uuid, WireError> {
        parse_id(&self.id)
    }
}

impl LabelSet {
    /// Convert to the core label-set representation.
    pub fn to_core(&self) -> trellis_core::Result<trellis_core::LabelSet> {
        let labels = self
            .labels
            .iter()
            .map(|l| {
                if l.name.is_empty() {
                    Err(trellis_core::Error::InvalidLabel(String::new()))
                } else {
                    Ok(trellis_core::Label::new(l.name.clone(), l.value.clone()))
                }
            })
            .collect::<trellis_core::Result<Vec<_>>>()?;
        Ok(trellis_core::LabelSet::new(labels))
    }

    /// Build the wire form from a core label set.
    pub fn from_core(set: &trellis_core::LabelSet) -> Self {
        Self {
            labels: set
                .iter()
                .map(|l| Label {
                    name: l.name.clone(),
                    value: l.value.clone(),
                })
                .collect(),
        }
    }

    /// Build the wire form from `name=value` strings.
    pub fn from_strings(parts: &[&str]) -> trellis_core::Result<Self> {
        Ok(Self::from_core(&trellis_core::LabelSet::parse(parts)?))
    }
}
