//! Control-plane error types and their status mapping.

use thiserror::Error;
use tonic::Status;
use trellis_registry::RegistryError;
use trellis_token::TokenError;

/// Control-plane error type.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("bad authentication information presented")]
    BadAuthentication,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Registry(#[from] RegistryError),

    #[error("signing backend error: {0}")]
    Upstream(TokenError),

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<ControlError>),
}

fn format_aggregate(errors: &[ControlError]) -> String {
    match errors {
        [single] => single.to_string(),
        many => {
            let parts: Vec<String> = many.iter().map(|e| e.to_string()).collect();
            format!("{} errors occurred: {}", many.len(), parts.join("; "))
        }
    }
}

impl From<trellis_proto::WireError> for ControlError {
    fn from(err: trellis_proto::WireError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<trellis_core::Error> for ControlError {
    fn from(err: trellis_core::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Registry(RegistryError::Serialization(err))
    }
}

impl From<ControlError> for Status {
    fn from(err: ControlError) -> Self {
        match &err {
            ControlError::BadAuthentication => Status::unauthenticated(err.to_string()),
            ControlError::InvalidRequest(_) => Status::invalid_argument(err.to_string()),
            ControlError::NotFound(_) => Status::not_found(err.to_string()),
            ControlError::Registry(re) => match re {
                RegistryError::NotFound(_) => Status::not_found(err.to_string()),
                RegistryError::AlreadyExists(_) => Status::invalid_argument(err.to_string()),
                _ => Status::internal(err.to_string()),
            },
            ControlError::Upstream(_) => Status::internal(err.to_string()),
            ControlError::Aggregate(_) => Status::internal(err.to_string()),
        }
    }
}

/// Result type for control-plane operations.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            Status::from(ControlError::BadAuthentication).code(),
            tonic::Code::Unauthenticated
        );
        assert_eq!(
            Status::from(ControlError::InvalidRequest("ns".into())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            Status::from(ControlError::Registry(RegistryError::AlreadyExists(
                "ns".into()
            )))
            .code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            Status::from(ControlError::Registry(RegistryError::Internal("db".into()))).code(),
            tonic::Code::Internal
        );
    }

    #[test]
    fn aggregate_reports_every_cause() {
        let err = ControlError::Aggregate(vec![
            ControlError::Registry(RegistryError::Internal("services".into())),
            ControlError::NotFound("hub".into()),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 errors occurred:"));
        assert!(message.contains("services"));
        assert!(message.contains("hub"));
    }
}
