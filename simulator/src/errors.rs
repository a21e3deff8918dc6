use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing environment variable: {0}")]
    MissingCredential(String),

    #[error("Invalid connection string: {0}")]
    InvalidCredential(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Connection refused by broker: {0}")]
    Refused(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport link closed")]
    LinkClosed,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether a reconnect could plausibly clear this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors
            Error::Mqtt(_) => true,
            Error::Connection(_) => true,
            Error::Timeout(..) => true,
            Error::LinkClosed => true,
            Error::Transport(_) => true,

            // Configuration won't change while we run
            Error::MissingCredential(_) => false,
            Error::InvalidCredential(_) => false,
            Error::Refused(_) => false,
            Error::Json(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
