//! Error types for Lodestar

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Message identifier assigned to an outstanding directory operation
pub type MessageId = i32;

/// Stage of a connection attempt or operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Low-level connection setup (socket, address resolution)
    Initialize,
    /// In-band encrypted transport upgrade (StartTLS)
    EncryptUpgrade,
    /// Bind handshake
    Authenticate,
    /// Operation on a bound connection
    Operation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Initialize => "initialization",
            Stage::EncryptUpgrade => "encryption upgrade",
            Stage::Authenticate => "authentication",
            Stage::Operation => "operation",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // Timing
    #[error("Timed out during {stage}")]
    Timeout { stage: Stage },

    // Handle Errors
    #[error("Unknown operation handle: {0}")]
    UnknownHandle(MessageId),

    #[error("Operation handle already registered: {0}")]
    DuplicateHandle(MessageId),

    // Entry Errors
    #[error("Value already present: {0}")]
    DuplicateValue(String),

    #[error("Value not present: {0}")]
    ValueNotFound(String),

    #[error("Operation batch capacity exceeded (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("Inconsistent entry state: {0}")]
    InconsistentState(String),

    // Server and Collaborator Errors
    #[error("Authentication failed (code {code}): {message}")]
    AuthenticationFailed { code: u32, message: String },

    #[error("Transport error during {stage}: {message}")]
    Transport { stage: Stage, message: String },

    #[error("Server returned code {code}: {message}")]
    Protocol {
        code: u32,
        message: String,
        matched_dn: String,
    },

    // Usage Errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transport failure reported by a collaborator, stage filled in later
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            stage: Stage::Operation,
            message: message.into(),
        }
    }

    /// Attach the stage that produced a collaborator error.
    ///
    /// Only variants that carry a stage are touched; everything else passes
    /// through unchanged.
    pub fn with_stage(self, stage: Stage) -> Self {
        match self {
            Error::Timeout { .. } => Error::Timeout { stage },
            Error::Transport { message, .. } => Error::Transport { stage, message },
            other => other,
        }
    }

    /// Internal invariant violations abort the current operation
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::InconsistentState(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "Timeout",
            Error::UnknownHandle(_) => "UnknownHandle",
            Error::DuplicateHandle(_) => "DuplicateHandle",
            Error::DuplicateValue(_) => "DuplicateValue",
            Error::ValueNotFound(_) => "ValueNotFound",
            Error::CapacityExceeded { .. } => "CapacityExceeded",
            Error::InconsistentState(_) => "InconsistentState",
            Error::AuthenticationFailed { .. } => "AuthenticationFailed",
            Error::Transport { .. } => "TransportError",
            Error::Protocol { .. } => "ProtocolError",
            Error::InvalidState(_) => "InvalidState",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Config(_) => "ConfigError",
            Error::Io(_) => "TransportError",
            Error::Other(_) => "InternalError",
        }
    }
}
