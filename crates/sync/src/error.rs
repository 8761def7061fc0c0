use mima_core::CoreError;
use mima_protocol::{ErrorKind, ProtocolError};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures of a bridge call. `Clone` so one fill failure can be handed to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Authority unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Channel to the authority closed")]
    ChannelClosed,

    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Authority error ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl SyncError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthorityUnavailable(_) => ErrorKind::AuthorityUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ChannelClosed => ErrorKind::ChannelClosed,
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Maps an `error` reply from the authority.
    pub fn from_remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::AuthorityUnavailable => Self::AuthorityUnavailable(message),
            ErrorKind::MalformedMessage => Self::MalformedMessage(message),
            kind => Self::Remote { kind, message },
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MessageTooLarge { len, max } => Self::MessageTooLarge { len, max },
            ProtocolError::Malformed(message) => Self::MalformedMessage(message),
            ProtocolError::Io(_) => Self::ChannelClosed,
        }
    }
}

/// Failures surfaced by a browsing context handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error(transparent)]
    Observation(#[from] CoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Browsing context closed")]
    Closed,
}

impl ContextError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Observation(err) => err.kind(),
            Self::Sync(err) => err.kind(),
            Self::Closed => ErrorKind::ChannelClosed,
        }
    }
}
