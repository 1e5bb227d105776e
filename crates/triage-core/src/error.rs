//! Error type for routing, assignment and agent operations

use thiserror::Error;

use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("assignment invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl RoutingError {
    pub fn conversation_not_found(id: i64) -> Self {
        Self::NotFound {
            kind: "conversation",
            id: id.to_string(),
        }
    }

    pub fn agent_not_found(id: i64) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    #[test]
    fn test_not_found_display() {
        let err = RoutingError::conversation_not_found(42);
        assert_eq!(err.to_string(), "conversation 42 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_provider_error_is_transparent() {
        let err: RoutingError = ProviderError::NotConfigured(ProviderKind::Claude).into();
        assert!(matches!(err, RoutingError::Provider(_)));
        assert!(err.to_string().contains("not configured"));
    }
}
