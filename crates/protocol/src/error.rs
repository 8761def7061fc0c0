use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error classes shared by every crate and carried on the wire in `error`
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidObservation,
    AuthorityUnavailable,
    Timeout,
    ChannelClosed,
    MessageTooLarge,
    MalformedMessage,
    Conflict,
    NotFound,
    InvalidConfig,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidObservation => "invalid_observation",
            Self::AuthorityUnavailable => "authority_unavailable",
            Self::Timeout => "timeout",
            Self::ChannelClosed => "channel_closed",
            Self::MessageTooLarge => "message_too_large",
            Self::MalformedMessage => "malformed_message",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::InvalidConfig => "invalid_config",
        }
    }

    /// Errors after which the connection can no longer be trusted.
    #[must_use]
    pub const fn is_channel_fatal(self) -> bool {
        matches!(
            self,
            Self::MessageTooLarge | Self::MalformedMessage | Self::ChannelClosed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::Malformed(_) => ErrorKind::MalformedMessage,
            Self::Io(_) => ErrorKind::ChannelClosed,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
