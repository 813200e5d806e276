use std::fmt;
use thiserror::Error;

use crate::retry::{FailureClass, RetryClassify};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// How far a call got before the network failed underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// The request never reached the remote.
    Connecting,
    /// The request may have been delivered; its effect on the remote is unknown.
    Transferring,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Transferring => f.write_str("transferring"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("transient network error while {phase}: {message}")]
    TransientNetwork {
        message: String,
        phase: ConnectionPhase,
    },
    #[error("remote does not support {operation}: {message}")]
    UnsupportedOperation { operation: String, message: String },
    #[error("remote error: {message}")]
    Remote { message: String },
    #[error("operation was cancelled")]
    Cancelled,
    #[error("abandoned {operation} after waiting {after_ms}ms for the remote to stop")]
    Abandoned { operation: String, after_ms: u64 },
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl ClientError {
    pub fn connecting(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
            phase: ConnectionPhase::Connecting,
        }
    }

    pub fn transferring(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
            phase: ConnectionPhase::Transferring,
        }
    }

    pub fn unsupported(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// True when the remote was provably never reached, so nothing can have started there.
    pub fn never_connected(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork {
                phase: ConnectionPhase::Connecting,
                ..
            }
        )
    }

    pub fn is_unsupported_operation(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Abandoned { .. })
    }
}

impl RetryClassify for ClientError {
    fn classify(&self) -> FailureClass {
        match self {
            Self::TransientNetwork { .. } => FailureClass::Retryable {
                never_connected: self.never_connected(),
            },
            Self::Cancelled => FailureClass::Cancelled,
            _ => FailureClass::Fatal,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}
