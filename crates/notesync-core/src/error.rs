//! Errors reported by collaborators

/// Failure of a collaborator call.
///
/// `Forbidden` is surfaced to clients as an authorization notice; every other
/// variant becomes a generic error notice.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("{message}")]
    Forbidden { message: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{message}")]
    Failed {
        message: String,
        cause: Option<String>,
    },
}

impl ServiceError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            cause: None,
        }
    }

    pub fn failed_with_cause(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Text shown to the client: the message, plus the cause when one is known
    pub fn client_message(&self) -> String {
        match self {
            Self::Failed {
                message,
                cause: Some(cause),
            } => format!("{}, cause: {}", message, cause),
            other => other.to_string(),
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_appends_cause() {
        let err = ServiceError::failed_with_cause("Fail to run paragraph", "interpreter died");
        assert_eq!(
            err.client_message(),
            "Fail to run paragraph, cause: interpreter died"
        );
        assert_eq!(ServiceError::not_found("No such note").client_message(), "No such note");
    }

    #[test]
    fn forbidden_is_detected() {
        assert!(ServiceError::forbidden("nope").is_forbidden());
        assert!(!ServiceError::failed("x").is_forbidden());
    }
}
