//! Error types for the live session and the Snap3D task poller

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for live session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid gateway URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Session not ready: {0}")]
    NotReady(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Code reported for failures that have no vendor or transport code.
pub const UNKNOWN_ERROR_CODE: i64 = -1;

/// Error type for Snap3D task tracking. Every variant is terminal for the task.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// Submit or status call failed at the transport level
    #[error("transport error {code}: {message}")]
    Transport { code: i64, message: String },

    /// The backend reported the task as failed
    #[error("task failed {code}: {message}")]
    Vendor { code: i64, message: String },

    /// An artifact could not be resolved into a texture or model
    #[error("resource fetch failed: {message}")]
    Resource { message: String },

    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn transport(code: i64, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Vendor-agnostic code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::Transport { code, .. } | Self::Vendor { code, .. } => *code,
            Self::Resource { .. } | Self::Cancelled => UNKNOWN_ERROR_CODE,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Transport { message, .. }
            | Self::Vendor { message, .. }
            | Self::Resource { message } => message.clone(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        let code = e
            .status()
            .map(|s| s.as_u16() as i64)
            .unwrap_or(UNKNOWN_ERROR_CODE);
        Self::transport(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_codes() {
        assert_eq!(TaskError::transport(503, "busy").code(), 503);
        assert_eq!(TaskError::resource("404 on texture").code(), -1);
        let vendor = TaskError::Vendor {
            code: 7,
            message: "nsfw prompt".to_string(),
        };
        assert_eq!(vendor.code(), 7);
        assert_eq!(vendor.message(), "nsfw prompt");
    }
}
