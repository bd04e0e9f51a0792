//! Conversation session - per-connection turn state machine
//!
//! One session per control socket. Client messages and internal events
//! (transcripts, synthesis progress) are fed in one at a time by the session
//! runner, so every transition happens on a single task. Sub-streams only
//! report back through [`SessionEvent`]s tagged with the utterance or turn
//! they belong to; events from an abandoned utterance or turn are dropped.

use crate::agent_turn::{self, AgentTurn, PlaybackLog};
use crate::conversation::{Attachments, Caption, History, ImageRef};
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::playback::PlaybackRegistry;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::stt::{self, collect_transcript, SpeechRecognitionConnection};
use crate::stt_pool::SpeechRecognitionPool;
use crate::timeline::Timeline;
use crate::tts::SpeechSynthesizer;
use crate::util::create_id;
use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Process-wide collaborators shared by every session
#[derive(Clone)]
pub struct Services {
    pub stt_pool: Arc<SpeechRecognitionPool>,
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<SpeechSynthesizer>,
    pub playback: Arc<PlaybackRegistry>,
}

/// Reports from the session's sub-streams
#[derive(Debug)]
pub enum SessionEvent {
    /// The transcript of an utterance ended
    Transcribed { utterance: u64, result: Result<String> },
    Captions { turn: u64, captions: Vec<Caption> },
    AgentFinished { turn: u64, text: String },
    AgentFailed { turn: u64, error: Error },
}

/// What to do once the transcript is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Standby,
    /// The client asked for playback before the turn existed
    StartStreaming,
}

enum SessionState {
    Idle,
    ReceivingAudio {
        connection: SpeechRecognitionConnection,
    },
    FinalizingTranscription {
        connection: SpeechRecognitionConnection,
        pending: PendingAction,
    },
    AgentWorking {
        turn: AgentTurn,
    },
    /// Reply complete. Keeps the turn id and playback log so late playback
    /// requests and interruptions still resolve.
    AgentDone {
        turn_id: String,
        log: PlaybackLog,
    },
    Closed,
    Error {
        cause: Error,
    },
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::ReceivingAudio { .. } => "RECEIVING_AUDIO",
            SessionState::FinalizingTranscription { .. } => "FINALIZING_TRANSCRIPTION",
            SessionState::AgentWorking { .. } => "AGENT_WORKING",
            SessionState::AgentDone { .. } => "AGENT_DONE",
            SessionState::Closed => "CLOSED",
            SessionState::Error { .. } => "ERROR",
        }
    }
}

pub struct ConversationSession {
    id: String,
    state: SessionState,
    history: History,
    /// Photos waiting for the next user message
    pending_images: Attachments,
    services: Services,
    client: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    utterance_seq: u64,
    turn_seq: u64,
    timeline: Arc<Timeline>,
}

impl ConversationSession {
    /// Create a session and greet the client. The returned receiver carries
    /// the session's internal events and must be fed back into
    /// [`ConversationSession::on_event`].
    pub fn new(
        services: Services,
        client: mpsc::UnboundedSender<ServerMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            id: create_id(),
            state: SessionState::Idle,
            history: History::new(),
            pending_images: Attachments::new(),
            services,
            client,
            events,
            utterance_seq: 0,
            turn_seq: 0,
            timeline: Arc::new(Timeline::new()),
        };
        info!("💬 Session {} started", session.id);
        session.send(ServerMessage::Ready);
        (session, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Closed or failed; the runner should stop.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Error { .. })
    }

    fn send(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!("[{}] client writer gone", self.id);
        }
    }

    /// Handle one message from the client.
    pub fn on_client(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Photo { data_uri } => {
                debug!("[{}] photo queued ({} bytes)", self.id, data_uri.len());
                self.pending_images.push(ImageRef(data_uri));
            }
            ClientMessage::LogRecordingStarted => self.timeline.mark("recording_started"),
            ClientMessage::PartialPlayback { content_played } => {
                self.on_partial_playback(&content_played)
            }
            ClientMessage::Unknown => debug!("[{}] ignoring unknown client message", self.id),
            message => self.on_turn_message(message),
        }
    }

    fn on_turn_message(&mut self, message: ClientMessage) {
        let from = self.state.name();
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        self.state = match (state, message) {
            // ===== IDLE / AGENT_DONE =====

            // Next user turn
            (SessionState::Idle | SessionState::AgentDone { .. }, ClientMessage::StartUploadStream) => {
                self.begin_utterance()
            }

            // Late playback request for a finished reply
            (SessionState::AgentDone { turn_id, mut log }, ClientMessage::StartPlayback) => {
                match self.services.playback.claim(&turn_id) {
                    Some(audio) => {
                        log.started.get_or_insert_with(std::time::Instant::now);
                        agent_turn::stream_to_client(audio, self.client.clone());
                    }
                    None => agent_turn::no_audio(&self.client),
                }
                SessionState::AgentDone { turn_id, log }
            }

            // Interrupted after the reply was complete: keep what was heard
            (SessionState::AgentDone { turn_id, log }, ClientMessage::AbortPlayback) => {
                let heard = log.heard();
                let rewritten = log.started.is_some()
                    && !heard.is_empty()
                    && self.history.truncate_last_assistant(&heard);
                let content_played = if rewritten {
                    heard
                } else {
                    self.history.last_assistant().unwrap_or_default().to_string()
                };
                info!("✋ [{}] playback of {} interrupted after completion", self.id, turn_id);
                self.send(ServerMessage::PlaybackInterrupted { content_played });
                SessionState::Idle
            }

            // ===== RECEIVING_AUDIO =====

            (SessionState::ReceivingAudio { connection }, ClientMessage::AudioChunk { value }) => {
                match general_purpose::STANDARD.decode(value.as_bytes()) {
                    Ok(audio) => connection.send(Bytes::from(audio)),
                    Err(e) => warn!("[{}] dropping undecodable audio chunk: {}", self.id, e),
                }
                SessionState::ReceivingAudio { connection }
            }

            (SessionState::ReceivingAudio { connection }, ClientMessage::AudioDone) => {
                self.timeline.mark("audio_done");
                connection.finish();
                SessionState::FinalizingTranscription {
                    connection,
                    pending: PendingAction::Standby,
                }
            }

            // Only one utterance at a time
            (
                state @ (SessionState::ReceivingAudio { .. }
                | SessionState::FinalizingTranscription { .. }),
                ClientMessage::StartUploadStream,
            ) => {
                self.send(ServerMessage::StartUploadStreamResult { success: false });
                state
            }

            // ===== FINALIZING_TRANSCRIPTION =====

            (SessionState::FinalizingTranscription { connection, .. }, ClientMessage::StartPlayback) => {
                SessionState::FinalizingTranscription {
                    connection,
                    pending: PendingAction::StartStreaming,
                }
            }

            // Utterance discarded
            (SessionState::FinalizingTranscription { connection, pending }, ClientMessage::AbortPlayback) => {
                connection.terminate();
                if pending == PendingAction::StartStreaming {
                    agent_turn::no_audio(&self.client);
                }
                info!("[{}] utterance abandoned", self.id);
                SessionState::Idle
            }

            // ===== AGENT_WORKING =====

            (SessionState::AgentWorking { mut turn }, ClientMessage::StartPlayback) => {
                self.start_streaming(&mut turn);
                SessionState::AgentWorking { turn }
            }

            (SessionState::AgentWorking { turn }, ClientMessage::AbortPlayback) => {
                self.interrupt(turn);
                SessionState::Idle
            }

            // Barge-in: the user starts talking over the reply
            (SessionState::AgentWorking { turn }, ClientMessage::StartUploadStream) => {
                self.interrupt(turn);
                self.begin_utterance()
            }

            // ===== ANY OTHER STATE =====

            // Nothing to play; end the client's wait right away
            (state, ClientMessage::StartPlayback) => {
                agent_turn::no_audio(&self.client);
                state
            }

            (state, message) => {
                debug!("[{}] {:?} ignored in {}", self.id, message, from);
                state
            }
        };

        let to = self.state.name();
        if from != to {
            debug!("[{}] {} -> {}", self.id, from, to);
        }
    }

    /// Handle one report from a sub-stream.
    pub fn on_event(&mut self, event: SessionEvent) {
        let from = self.state.name();
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        self.state = match (state, event) {
            // ===== RECEIVING_AUDIO / FINALIZING_TRANSCRIPTION =====

            // The recognizer ended the utterance on its own, or after AUDIO_DONE
            (SessionState::ReceivingAudio { connection }, SessionEvent::Transcribed { utterance, result })
                if utterance == self.utterance_seq =>
            {
                connection.terminate();
                self.on_transcript(result, PendingAction::Standby)
            }
            (
                SessionState::FinalizingTranscription { connection, pending },
                SessionEvent::Transcribed { utterance, result },
            ) if utterance == self.utterance_seq => {
                connection.terminate();
                self.on_transcript(result, pending)
            }

            // ===== AGENT_WORKING =====

            (SessionState::AgentWorking { mut turn }, SessionEvent::Captions { turn: seq, captions })
                if seq == turn.seq() =>
            {
                turn.record_captions(captions);
                SessionState::AgentWorking { turn }
            }

            (SessionState::AgentWorking { turn }, SessionEvent::AgentFinished { turn: seq, text })
                if seq == turn.seq() =>
            {
                if !text.is_empty() {
                    self.history.push_assistant(&text);
                }
                info!("🤖 [{}] reply complete ({} chars)", self.id, text.len());
                self.timeline.log(&self.id);
                let (turn_id, log) = turn.into_log();
                SessionState::AgentDone { turn_id, log }
            }

            (SessionState::AgentWorking { turn }, SessionEvent::AgentFailed { turn: seq, error })
                if seq == turn.seq() =>
            {
                drop(turn);
                self.fail(error)
            }

            // ===== STALE =====
            (state, event) => {
                debug!("[{}] stale event in {}: {:?}", self.id, from, event);
                state
            }
        };

        let to = self.state.name();
        if from != to {
            debug!("[{}] {} -> {}", self.id, from, to);
        }
    }

    /// The control socket is gone. Tears down every sub-connection and waits
    /// until an active reply has closed its upstream connections.
    pub async fn on_disconnect(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        match state {
            SessionState::ReceivingAudio { connection }
            | SessionState::FinalizingTranscription { connection, .. } => connection.terminate(),
            SessionState::AgentWorking { turn } => {
                let (heard, driver) = turn.cancel();
                if !heard.is_empty() {
                    self.history.push_assistant(&heard);
                }
                let _ = driver.await;
            }
            SessionState::Error { cause } => {
                self.state = SessionState::Error { cause };
            }
            _ => {}
        }
        info!("👋 Session {} closed in {}", self.id, self.state.name());
    }

    fn begin_utterance(&mut self) -> SessionState {
        let mut connection = self.services.stt_pool.acquire();
        self.utterance_seq += 1;
        let utterance = self.utterance_seq;

        let Some(transcript) = connection.take_transcript() else {
            connection.terminate();
            return self.fail(Error::upstream(stt::SERVICE, "transcript already consumed"));
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = collect_transcript(transcript).await;
            let _ = events.send(SessionEvent::Transcribed { utterance, result });
        });

        self.timeline.mark("upload_started");
        info!("🎤 [{}] utterance {} on stt#{}", self.id, utterance, connection.id());
        self.send(ServerMessage::StartUploadStreamResult { success: true });
        SessionState::ReceivingAudio { connection }
    }

    fn on_transcript(&mut self, result: Result<String>, pending: PendingAction) -> SessionState {
        let text = result.and_then(|text| {
            if text.trim().is_empty() {
                Err(Error::TranscriptionEmpty)
            } else {
                Ok(text)
            }
        });

        match text {
            Ok(text) => self.start_turn(text, pending),
            Err(Error::TranscriptionEmpty) => {
                info!("[{}] empty transcription", self.id);
                self.send(ServerMessage::TranscriptionComplete {
                    transcription: String::new(),
                });
                if pending == PendingAction::StartStreaming {
                    agent_turn::no_audio(&self.client);
                }
                SessionState::Idle
            }
            Err(e) => self.fail(e),
        }
    }

    fn start_turn(&mut self, text: String, pending: PendingAction) -> SessionState {
        self.timeline.mark("transcription_complete");
        info!("📝 [{}] user: {}", self.id, text);
        self.send(ServerMessage::TranscriptionComplete {
            transcription: text.clone(),
        });

        let attachments = std::mem::take(&mut self.pending_images);
        self.history.push_user(&text, attachments);

        self.turn_seq += 1;
        let mut turn = AgentTurn::start(
            self.turn_seq,
            &self.services,
            self.history.messages().to_vec(),
            self.client.clone(),
            self.events.clone(),
            self.timeline.clone(),
        );
        self.send(ServerMessage::ResponseStarted {
            playback_url: turn.playback_url(),
        });

        if pending == PendingAction::StartStreaming {
            self.start_streaming(&mut turn);
        }
        SessionState::AgentWorking { turn }
    }

    fn start_streaming(&self, turn: &mut AgentTurn) {
        if turn.is_streaming() {
            debug!("[{}] turn {} already streaming", self.id, turn.id());
            return;
        }
        match self.services.playback.claim(turn.id()) {
            Some(audio) => {
                agent_turn::stream_to_client(audio, self.client.clone());
                turn.mark_playback_started();
            }
            None => {
                warn!("[{}] audio for {} already claimed", self.id, turn.id());
                agent_turn::no_audio(&self.client);
            }
        }
    }

    fn interrupt(&mut self, turn: AgentTurn) {
        let (heard, driver) = turn.cancel();
        if !heard.is_empty() {
            self.history.push_assistant(&heard);
        }
        info!("✋ [{}] reply interrupted, heard {:?}", self.id, heard);
        self.send(ServerMessage::PlaybackInterrupted { content_played: heard });
        self.timeline.log(&self.id);

        let id = self.id.clone();
        tokio::spawn(async move {
            let _ = driver.await;
            debug!("[{}] interrupted turn torn down", id);
        });
    }

    fn on_partial_playback(&mut self, content_played: &str) {
        if content_played.is_empty() {
            return;
        }
        // The running turn records its own heard prefix when interrupted
        if matches!(self.state, SessionState::AgentWorking { .. }) {
            debug!("[{}] partial playback ignored while agent is working", self.id);
            return;
        }
        if !self.history.truncate_last_assistant(content_played) {
            self.history.push_assistant(content_played);
        }
    }

    fn fail(&mut self, cause: Error) -> SessionState {
        error!("❌ [{}] session failed: {}", self.id, cause);
        self.send(ServerMessage::from(&cause));
        SessionState::Error { cause }
    }
}
