use thiserror::Error;

use crate::webrtc::MediaKind;

/// Coarse failure classes callers can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Transport,
    Protocol,
    Timeout,
    Negotiation,
    State,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("invalid negotiation request: {0}")]
    InvalidRequest(String),
    #[error("can't add {0} stream, there already is one")]
    AlreadyPresent(MediaKind),
    #[error("no peer connection: if this is an answer, use create_answer and not handle_remote_jsep")]
    NoPeerConnection,
    #[error("webrtc engine error: {0}")]
    Engine(String),
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JanusError {
    #[error("config error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("error connecting to any of the provided servers ({attempted} attempted)")]
    AllServersFailed { attempted: usize },
    #[error("gateway error {code}: {reason}")]
    Protocol { code: i64, reason: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("invalid state: {0}")]
    State(String),
    #[error("request cancelled before a reply arrived")]
    Cancelled,
}

impl JanusError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            JanusError::Config(_) => ErrorCategory::Config,
            JanusError::Transport(_) | JanusError::AllServersFailed { .. } => {
                ErrorCategory::Transport
            }
            JanusError::Protocol { .. } => ErrorCategory::Protocol,
            JanusError::Timeout(_) => ErrorCategory::Timeout,
            JanusError::Negotiation(_) => ErrorCategory::Negotiation,
            JanusError::State(_) | JanusError::Cancelled => ErrorCategory::State,
        }
    }

    pub(crate) fn not_connected() -> Self {
        JanusError::State("is the server down? (connected=false)".into())
    }

    pub(crate) fn invalid_handle(handle_id: u64) -> Self {
        JanusError::State(format!("invalid handle {handle_id}"))
    }
}

impl From<reqwest::Error> for JanusError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            JanusError::Timeout(value.to_string())
        } else {
            JanusError::Transport(value.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for JanusError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        JanusError::Transport(value.to_string())
    }
}

impl From<serde_json::Error> for JanusError {
    fn from(value: serde_json::Error) -> Self {
        JanusError::Transport(format!("malformed message: {value}"))
    }
}

pub type JanusResult<T> = Result<T, JanusError>;
