// Bridge sync error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bridge server unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Prompt rejected: {0}")]
    PromptRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// The backend dropped the session; callers recreate it instead of surfacing an error.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, SyncError::SessionNotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout(_))
    }

    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, SyncError::Unreachable(_) | SyncError::Timeout(_))
    }

    /// Text for a synthesized error message shown in the conversation.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Unreachable(_) => {
                "Could not reach the agent server. Check that the environment is running and retry."
                    .to_string()
            }
            SyncError::Timeout(_) => {
                "The agent server did not respond in time. Retry in a moment.".to_string()
            }
            SyncError::PromptRejected(reason) => format!("Failed to send message: {}", reason),
            other => format!("Error: {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recoverable_and_fatal_errors() {
        assert!(SyncError::SessionNotFound("ses_1".into()).is_session_not_found());
        assert!(SyncError::Timeout("handshake".into()).is_connection_fatal());
        assert!(SyncError::Unreachable("refused".into()).is_connection_fatal());
        assert!(!SyncError::Transport("500".into()).is_connection_fatal());
    }

    #[test]
    fn prompt_rejection_message_names_reason() {
        let msg = SyncError::PromptRejected("rate limited".into()).user_message();
        assert_eq!(msg, "Failed to send message: rate limited");
    }
}
