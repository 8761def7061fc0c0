use mima_protocol::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Toml(String),

    #[error("Randomness unavailable: {0}")]
    Random(String),
}

impl CoreError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidObservation(_) => ErrorKind::InvalidObservation,
            Self::InvalidConfig(_) | Self::Toml(_) | Self::Random(_) => ErrorKind::InvalidConfig,
        }
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Toml(err.to_string())
    }
}
