//! One agent reply: language model tokens piped into speech synthesis.
//!
//! The turn's audio goes into a playback queue registered under the turn id.
//! Captions go straight to the client and are reported back to the session,
//! together with the terminal outcome, as [`SessionEvent`]s.

use crate::conversation::{heard_prefix, Caption, ConversationMessage};
use crate::protocol::ServerMessage;
use crate::queue::{QueueReader, QueueWriter};
use crate::session::{Services, SessionEvent};
use crate::timeline::Timeline;
use crate::tts::{SynthesisEvent, SynthesisStream};
use crate::util::create_id;
use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

/// Captions and playback timing of a turn, enough to work out what was heard.
#[derive(Debug, Clone, Default)]
pub struct PlaybackLog {
    pub captions: Vec<Caption>,
    pub started: Option<Instant>,
}

impl PlaybackLog {
    /// Milliseconds of audio the client has played, as far as the server knows.
    pub fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn heard(&self) -> String {
        heard_prefix(&self.captions, self.elapsed_ms())
    }
}

/// A running reply. Dropping it cancels the upstream work.
pub struct AgentTurn {
    seq: u64,
    id: String,
    cancel: DropGuard,
    log: PlaybackLog,
    driver: JoinHandle<()>,
}

impl AgentTurn {
    /// Start generating and synthesizing a reply to `history`.
    pub fn start(
        seq: u64,
        services: &Services,
        history: Vec<ConversationMessage>,
        client: mpsc::UnboundedSender<ServerMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
        timeline: Arc<Timeline>,
    ) -> Self {
        let id = create_id();
        let cancel = CancellationToken::new();
        let audio = services.playback.register(&id);
        let tokens = services.model.stream_reply(history, cancel.child_token());
        let synthesis = services
            .synthesizer
            .stream(id.clone(), tokens, cancel.child_token());
        timeline.mark("agent_started");
        info!("🤖 Agent turn {} started", id);

        let driver = tokio::spawn(drive(seq, synthesis, audio, client, events, timeline));

        Self {
            seq,
            id,
            cancel: cancel.drop_guard(),
            log: PlaybackLog::default(),
            driver,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn playback_url(&self) -> String {
        format!("/playback/{}", self.id)
    }

    pub fn record_captions(&mut self, captions: Vec<Caption>) {
        self.log.captions.extend(captions);
    }

    pub fn is_streaming(&self) -> bool {
        self.log.started.is_some()
    }

    pub fn mark_playback_started(&mut self) {
        self.log.started.get_or_insert_with(Instant::now);
    }

    /// Finished normally; keep what is needed for a later interruption.
    pub fn into_log(self) -> (String, PlaybackLog) {
        (self.id, self.log)
    }

    /// Stop producing audio. Returns what the listener heard so far and the
    /// driver handle, which completes once the upstream connections are closed.
    pub fn cancel(self) -> (String, JoinHandle<()>) {
        let AgentTurn {
            id,
            cancel,
            log,
            driver,
            ..
        } = self;
        let heard = log.heard();
        drop(cancel);
        debug!("Agent turn {} cancelled, heard {:?}", id, heard);
        (heard, driver)
    }
}

async fn drive(
    seq: u64,
    mut synthesis: SynthesisStream,
    audio: QueueWriter<Bytes>,
    client: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    timeline: Arc<Timeline>,
) {
    let mut first_audio = true;
    while let Some(event) = synthesis.next().await {
        match event {
            SynthesisEvent::Audio(frame) => {
                if first_audio {
                    timeline.mark("first_audio");
                    first_audio = false;
                }
                audio.write(frame);
            }
            SynthesisEvent::Captions(captions) => {
                let _ = client.send(ServerMessage::AudioCaption {
                    captions: captions.clone(),
                });
                let _ = events.send(SessionEvent::Captions { turn: seq, captions });
            }
            SynthesisEvent::Finished { text } => {
                audio.close();
                let _ = events.send(SessionEvent::AgentFinished { turn: seq, text });
            }
            SynthesisEvent::Failed(error) => {
                audio.close();
                let _ = events.send(SessionEvent::AgentFailed { turn: seq, error });
            }
        }
    }
    // Cancelled turns end without a terminal event
    audio.close();
}

/// Forward a turn's audio queue to the control socket, ending with the
/// terminal `done` frame.
pub fn stream_to_client(
    mut audio: QueueReader<Bytes>,
    client: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = audio.next().await {
            let value = general_purpose::STANDARD.encode(&frame);
            if client.send(ServerMessage::audio(value)).is_err() {
                return;
            }
        }
        let _ = client.send(ServerMessage::audio_done());
    })
}

/// Tell the client its audio is over when there is nothing to stream.
pub fn no_audio(client: &mpsc::UnboundedSender<ServerMessage>) {
    let _ = client.send(ServerMessage::audio_done());
}
