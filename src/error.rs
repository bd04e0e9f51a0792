//! Error type shared by every component of the orchestrator.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors raised while running a conversation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An upstream duplex connection could not be opened.
    #[error("failed to open {service} connection: {reason}")]
    ConnectionSetup {
        service: &'static str,
        reason: String,
    },

    /// An upstream service answered with an explicit error event.
    #[error("{service} reported an error: {message}")]
    UpstreamProtocol {
        service: &'static str,
        message: String,
    },

    /// The utterance ended without any recognized speech.
    #[error("utterance ended without recognized speech")]
    TranscriptionEmpty,

    /// The control socket broke mid-session.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The turn was cancelled by the client. Not a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn setup(service: &'static str, reason: impl ToString) -> Self {
        Self::ConnectionSetup {
            service,
            reason: reason.to_string(),
        }
    }

    pub fn upstream(service: &'static str, message: impl ToString) -> Self {
        Self::UpstreamProtocol {
            service,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
