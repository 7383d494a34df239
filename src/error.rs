//! Error type shared by the service layer.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Validation(String),

    #[error("Missing required variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("Agent with id {0} not found")]
    AgentNotFound(i64),

    #[error("Agent '{0}' is not active")]
    AgentInactive(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variables_lists_every_name() {
        let err = ServiceError::MissingVariables(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Missing required variables: a, b");
    }
}
