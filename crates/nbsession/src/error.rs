//! Session-layer errors.

use crate::commands::CommandError;
use crate::kernel::KernelError;
use crate::resume::ResumeError;
use crate::CloseCode;

/// Errors surfaced by sessions, rooms and the session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A second main consumer was attached while one is still present.
    #[error("room already has a main consumer ({0})")]
    MainConsumerExists(String),

    #[error("consumer {0} is already attached")]
    DuplicateConsumer(String),

    #[error("session is closed")]
    Closed,

    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("resume failed: {0}")]
    Resume(#[from] ResumeError),

    #[error("failed to resolve notebook {file_key}: {source}")]
    Resolve {
        file_key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The connection is refused; the transport closes it with `code`.
    #[error("connection refused ({}): {reason}", code.code())]
    Refused { code: CloseCode, reason: String },

    #[error("extension {name} failed to attach: {source}")]
    Extension {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("file manager error: {0}")]
    FileManager(#[source] anyhow::Error),
}

impl SessionError {
    /// Close code the transport should use when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            SessionError::Refused { code, .. } => *code,
            SessionError::MainConsumerExists(_) => CloseCode::AlreadyConnected,
            _ => CloseCode::UnexpectedError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        let refused = SessionError::Refused {
            code: CloseCode::Forbidden,
            reason: "bad token".into(),
        };
        assert_eq!(refused.close_code(), CloseCode::Forbidden);
        assert!(refused.to_string().contains("1008"));

        assert_eq!(
            SessionError::MainConsumerExists("c1".into()).close_code(),
            CloseCode::AlreadyConnected
        );
        assert_eq!(SessionError::Closed.close_code(), CloseCode::UnexpectedError);
    }
}
