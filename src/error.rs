use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use url::ParseError;

pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;

/// Failures of the credential layer.
///
/// Cloneable so that the outcome of a single refresh can be handed to every
/// caller that waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No valid token available and no refresh token stored")]
    TokenUnavailable,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Client Error: status={status}, code={code}, message={message}, data={data:?}")]
    ClientError {
        status: StatusCode,
        code: i64,
        message: String,
        data: Option<Value>,
        header: HeaderMap,
    },

    #[error("Server Error: status={status}, code={code}, message={message}")]
    ServerError {
        status: StatusCode,
        code: i64,
        message: String,
        header: HeaderMap,
    },

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Authentication Error: {0}")]
    Auth(#[from] AuthError),

    #[error("Message Parse Error: {0}")]
    MessageParse(String),

    #[error("Send Rejected: {0}")]
    SendRejected(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("HTTP Request Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("Invalid HTTP Header Value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(e.to_string())
    }
}

impl RealtimeError {
    /// Errors the connection layer recovers from by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport(_) | RealtimeError::Protocol(_)
        )
    }
}
