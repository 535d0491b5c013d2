//! Error types for the TCAP provider

use crate::tcap::PAbortCause;
use crate::types::TransactionId;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, TcapError>;

/// Top-level TCAP provider error
#[derive(Debug, Error)]
pub enum TcapError {
    #[error("Current dialog count exceeds its maximum value ({max})")]
    CapacityExceeded { max: usize },

    #[error("Suggested local TransactionId is already present in system: {0}")]
    IdAlreadyInUse(TransactionId),

    #[error("Preview dialog with trId={0} already exists; dropping current dialog")]
    DuplicateKeyCollision(TransactionId),

    #[error("Can not create a Dialog in preview mode")]
    PreviewMode,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("SCCP error: {0}")]
    Sccp(#[from] SccpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider is not started")]
    NotStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structural decode failure reported by a [`crate::tcap::MessageCodec`]
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseError {
    /// Abort cause the codec wants signalled to the peer, if any
    pub abort_cause: Option<PAbortCause>,
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            abort_cause: None,
            message: message.into(),
        }
    }

    pub fn with_cause(cause: PAbortCause, message: impl Into<String>) -> Self {
        Self {
            abort_cause: Some(cause),
            message: message.into(),
        }
    }
}

/// SCCP transport errors
#[derive(Debug, Error)]
pub enum SccpError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Subsystem {0} already has a registered listener")]
    SubsystemInUse(u8),

    #[error("No route for address: {0}")]
    NoRoute(String),
}

impl From<config::ConfigError> for TcapError {
    fn from(err: config::ConfigError) -> Self {
        TcapError::Config(err.to_string())
    }
}
