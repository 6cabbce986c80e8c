use thiserror::Error;

use crate::chat::model::RoomId;

/// Error types for the room client
#[derive(Debug, Error)]
pub enum ChatError {
    /// Push transport errors (handshake, subscribe or unexpected drop)
    #[error("Transport error: {0}")]
    Transport(String),

    /// REST errors, `status` is `None` when no response was received
    #[error("Request failed ({}): {message}", status_label(.status))]
    Request {
        status: Option<u16>,
        message: String,
    },

    /// Malformed push payload
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// Rejected credentials, on REST (401) or at the push handshake
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Local send refusals
    #[error("Message content cannot be empty")]
    EmptyMessage,

    #[error("Another message is still being sent")]
    SendInProgress,

    #[error("Room {0} is closed")]
    RoomClosed(RoomId),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no response".to_string(),
    }
}

/// Convenience type alias for Results using ChatError
pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub fn transport(msg: impl Into<String>) -> Self {
        ChatError::Transport(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        ChatError::Decode(msg.into())
    }

    pub fn request(status: Option<u16>, msg: impl Into<String>) -> Self {
        ChatError::Request {
            status,
            message: msg.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::Transport(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 => ChatError::Auth(err.to_string()),
            Some(status) => ChatError::request(Some(status.as_u16()), err.to_string()),
            None if err.is_decode() => ChatError::decode(err.to_string()),
            None => ChatError::request(None, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(ref response) if response.status().as_u16() == 401 => {
                ChatError::Auth(err.to_string())
            }
            other => ChatError::Transport(other.to_string()),
        }
    }
}
