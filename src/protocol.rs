//! Control channel messages
//!
//! JSON text frames tagged by `type`. Unknown client message types decode to
//! [`ClientMessage::Unknown`] and are ignored by the session.

use crate::conversation::Caption;
use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    StartUploadStream,
    /// Base64 encoded microphone audio
    AudioChunk {
        value: String,
    },
    AudioDone,
    StartPlayback,
    AbortPlayback,
    /// Client-measured text that was played before the user interrupted
    PartialPlayback {
        #[serde(rename = "contentPlayed")]
        content_played: String,
    },
    /// Image to attach to the next user turn
    Photo {
        #[serde(rename = "dataUri")]
        data_uri: String,
    },
    LogRecordingStarted,
    #[serde(other)]
    Unknown,
}

/// Messages sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Ready,
    StartUploadStreamResult {
        success: bool,
    },
    TranscriptionComplete {
        transcription: String,
    },
    /// Base64 audio frame; the last one has `done: true` and no value
    AudioChunk {
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        done: bool,
    },
    AudioCaption {
        captions: Vec<Caption>,
    },
    ResponseStarted {
        #[serde(rename = "playbackUrl")]
        playback_url: String,
    },
    PlaybackInterrupted {
        #[serde(rename = "contentPlayed")]
        content_played: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn audio(value: String) -> Self {
        Self::AudioChunk {
            value: Some(value),
            done: false,
        }
    }

    pub fn audio_done() -> Self {
        Self::AudioChunk {
            value: None,
            done: true,
        }
    }
}

impl From<&Error> for ServerMessage {
    fn from(error: &Error) -> Self {
        ServerMessage::Error {
            message: error.to_string(),
        }
    }
}
