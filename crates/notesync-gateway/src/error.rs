//! Gateway errors

use notesync_core::ServiceError;

use crate::protocol::{Op, OutboundMessage};

/// Gateway-level errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failure while handling one client message
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{message}")]
    Forbidden { message: String },

    #[error("Note is now running sequentially. Can not be performed: {op}")]
    OperationConflict { op: Op },

    #[error("{}", .0.client_message())]
    Backend(ServiceError),

    #[error("{0}")]
    InvalidMessage(String),

    #[error("Invalid message: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<ServiceError> for DispatchError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Forbidden { message } => Self::Forbidden { message },
            other => Self::Backend(other),
        }
    }
}

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    /// Notice sent back to the client that caused the failure
    pub fn to_reply(&self) -> OutboundMessage {
        match self {
            Self::Forbidden { message } => OutboundMessage::auth_info(message.clone()),
            other => OutboundMessage::error_info(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_becomes_auth_info() {
        let err: DispatchError = ServiceError::forbidden("Insufficient privileges").into();
        let reply = err.to_reply();
        assert_eq!(reply.op, Op::AuthInfo);
        assert_eq!(reply.data["info"], "Insufficient privileges");
    }

    #[test]
    fn test_backend_failure_includes_cause() {
        let err: DispatchError =
            ServiceError::failed_with_cause("Fail to run paragraph", "interpreter died").into();
        let reply = err.to_reply();
        assert_eq!(reply.op, Op::ErrorInfo);
        assert_eq!(
            reply.data["info"],
            "Fail to run paragraph, cause: interpreter died"
        );
    }

    #[test]
    fn test_conflict_message() {
        let err = DispatchError::OperationConflict {
            op: Op::CommitParagraph,
        };
        assert_eq!(
            err.to_string(),
            "Note is now running sequentially. Can not be performed: COMMIT_PARAGRAPH"
        );
    }
}
