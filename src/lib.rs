//! Talkback - server-side orchestrator for real-time voice conversations
//!
//! A client streams microphone audio over a control socket. The server
//! transcribes it, asks a language model for a reply, synthesizes the reply
//! as it streams in and sends the audio back, with interruption at any point.

#![forbid(unsafe_code)]

/// Per-turn reply pipeline: language model into speech synthesis
pub mod agent_turn;
pub mod config;
/// Conversation history, captions and heard-prefix arithmetic
pub mod conversation;
pub mod error;
/// Streaming chat-completions client
pub mod llm;
/// Audio queues for decoupled playback readers
pub mod playback;
/// Control channel message types
pub mod protocol;
/// Single-producer, single-consumer async queue
pub mod queue;
pub mod server;
/// Turn state machine
pub mod session;
pub mod session_runner;
/// Speech recognition connections
pub mod stt;
pub mod stt_pool;
pub mod timeline;
/// Upstream websocket dialing
pub mod transport;
/// Streaming speech synthesis
pub mod tts;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};
