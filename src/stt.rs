//! Speech recognition connection
//!
//! One [`SpeechRecognitionConnection`] carries one utterance. The handle is
//! usable immediately: audio sent while the websocket is still opening is
//! queued and flushed in order once it is ready. A background task owns the
//! websocket, sends keepalives, decides when the utterance is over and writes
//! transcript fragments to a [`TranscriptStream`].

use crate::config::SttConfig;
use crate::error::{Error, Result};
use crate::queue::{self, QueueReader, QueueWriter};
use crate::transport::{self, Dialer, Duplex, WsSink, WsSource};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub(crate) const SERVICE: &str = "speech-to-text";

const KEEPALIVE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Transcript fragments of one utterance, in arrival order. An `Err` item is
/// always the last item.
pub type TranscriptStream = QueueReader<Result<String>>;

/// Lifecycle of a connection as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closed,
    Error,
}

#[derive(Debug)]
enum Command {
    Audio(Bytes),
    Finish,
    Terminate,
}

/// Settings copied into each connection task
#[derive(Debug, Clone, Copy)]
struct Settings {
    keepalive_interval: Duration,
    blank_events_to_end: usize,
    connect_timeout: Duration,
}

/// Handle to one upstream speech recognition connection
pub struct SpeechRecognitionConnection {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    transcript: Option<TranscriptStream>,
}

impl SpeechRecognitionConnection {
    /// Start opening a connection. Returns at once; dialing happens in the
    /// background.
    pub fn open(dialer: Arc<dyn Dialer>, config: &SttConfig, connect_timeout: Duration) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (out, transcript) = queue::channel();
        let settings = Settings {
            keepalive_interval: config.keepalive_interval,
            blank_events_to_end: config.blank_events_to_end.max(1),
            connect_timeout,
        };

        tokio::spawn(run(id, dialer, settings, command_rx, state_tx, out));

        Self {
            id,
            commands,
            state,
            transcript: Some(transcript),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection can still take an utterance.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Ready
        )
    }

    /// Queue or forward a chunk of audio.
    pub fn send(&self, audio: Bytes) {
        let _ = self.commands.send(Command::Audio(audio));
    }

    /// Signal end of input. The upstream flushes its final transcripts and the
    /// transcript stream ends.
    pub fn finish(&self) {
        let _ = self.commands.send(Command::Finish);
    }

    /// Force-close from any state. Safe to call repeatedly.
    pub fn terminate(&self) {
        let _ = self.commands.send(Command::Terminate);
    }

    /// Take the transcript stream. Available once.
    pub fn take_transcript(&mut self) -> Option<TranscriptStream> {
        self.transcript.take()
    }

    /// Wait until the connection leaves `Connecting`.
    pub async fn wait_ready(&mut self) -> ConnectionState {
        let _ = self
            .state
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await;
        self.state()
    }
}

/// Read a transcript stream to the end and join its fragments with spaces.
pub async fn collect_transcript(mut stream: TranscriptStream) -> Result<String> {
    let mut fragments = Vec::new();
    while let Some(item) = stream.next().await {
        fragments.push(item?);
    }
    Ok(fragments.join(" "))
}

/// End-of-utterance heuristic.
///
/// An utterance is complete when the recognizer flags it speech-final, or
/// after `blank_events_to_end` consecutive blank transcripts that follow at
/// least one non-blank transcript.
#[derive(Debug)]
pub struct EndpointDetector {
    blank_events_to_end: usize,
    heard_speech: bool,
    blank_run: usize,
}

/// What one transcript event contributes
#[derive(Debug, PartialEq, Eq)]
pub struct Observation {
    pub fragment: Option<String>,
    pub complete: bool,
}

impl EndpointDetector {
    pub fn new(blank_events_to_end: usize) -> Self {
        Self {
            blank_events_to_end: blank_events_to_end.max(1),
            heard_speech: false,
            blank_run: 0,
        }
    }

    pub fn observe(&mut self, text: &str, is_final: bool, speech_final: bool) -> Observation {
        let text = text.trim();
        if text.is_empty() {
            if self.heard_speech {
                self.blank_run += 1;
            }
            return Observation {
                fragment: None,
                complete: self.heard_speech
                    && (speech_final || self.blank_run >= self.blank_events_to_end),
            };
        }

        self.heard_speech = true;
        self.blank_run = 0;
        Observation {
            // Interim hypotheses are revised later; only final text counts
            fragment: (is_final || speech_final).then(|| text.to_string()),
            complete: speech_final,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RecognizerMessage {
    Results {
        channel: ResultChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    Metadata {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ResultChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

enum Flow {
    Continue,
    Stop,
}

enum Outcome {
    Completed,
    Terminated,
    UpstreamClosed,
}

async fn run(
    id: u64,
    dialer: Arc<dyn Dialer>,
    settings: Settings,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    out: QueueWriter<Result<String>>,
) {
    // ===== CONNECTING =====
    let mut queued = Vec::new();
    let dial = transport::dial_with_timeout(dialer.as_ref(), settings.connect_timeout);
    tokio::pin!(dial);
    let dialed = loop {
        tokio::select! {
            result = &mut dial => break result,
            command = commands.recv() => match command {
                Some(Command::Terminate) | None => {
                    debug!("stt#{} terminated while connecting", id);
                    state_tx.send_replace(ConnectionState::Closed);
                    out.close();
                    return;
                }
                Some(command) => queued.push(command),
            }
        }
    };

    let Duplex {
        mut sink,
        mut source,
    } = match dialed {
        Ok(duplex) => duplex,
        Err(e) => {
            error!("stt#{} failed to connect: {}", id, e);
            state_tx.send_replace(ConnectionState::Error);
            out.write(Err(e));
            out.close();
            return;
        }
    };

    // ===== READY =====
    state_tx.send_replace(ConnectionState::Ready);
    debug!("stt#{} ready, flushing {} queued commands", id, queued.len());

    let outcome = drive(id, &mut sink, &mut source, queued, &mut commands, &out, settings).await;
    let _ = sink.close().await;

    match outcome {
        Ok(outcome) => {
            match outcome {
                Outcome::Completed => info!("🎤 stt#{} utterance complete", id),
                Outcome::Terminated => debug!("stt#{} terminated", id),
                Outcome::UpstreamClosed => debug!("stt#{} closed by upstream", id),
            }
            state_tx.send_replace(ConnectionState::Closed);
        }
        Err(e) => {
            warn!("stt#{} failed: {}", id, e);
            state_tx.send_replace(ConnectionState::Error);
            out.write(Err(e));
        }
    }
    out.close();
}

async fn drive(
    id: u64,
    sink: &mut WsSink,
    source: &mut WsSource,
    queued: Vec<Command>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    out: &QueueWriter<Result<String>>,
    settings: Settings,
) -> Result<Outcome> {
    let mut detector = EndpointDetector::new(settings.blank_events_to_end);
    let mut input_open = true;
    let mut commands_open = true;

    for command in queued {
        if let Flow::Stop = forward(sink, command, &mut input_open).await? {
            return Ok(Outcome::Terminated);
        }
    }

    let period = settings.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(command) => {
                    if let Flow::Stop = forward(sink, command, &mut input_open).await? {
                        return Ok(Outcome::Terminated);
                    }
                }
                // Handle dropped mid-utterance: nobody will ever finish it
                None if input_open => return Ok(Outcome::Terminated),
                None => commands_open = false,
            },
            _ = keepalive.tick(), if input_open => {
                sink.send(Message::text(KEEPALIVE.to_string())).await?;
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RecognizerMessage>(text.as_str()) {
                        Ok(RecognizerMessage::Results { channel, is_final, speech_final }) => {
                            let text = channel
                                .alternatives
                                .into_iter()
                                .next()
                                .map(|a| a.transcript)
                                .unwrap_or_default();
                            debug!("stt#{} transcript {:?} final={} speech_final={}", id, text, is_final, speech_final);
                            let observation = detector.observe(&text, is_final, speech_final);
                            if let Some(fragment) = observation.fragment {
                                out.write(Ok(fragment));
                            }
                            if observation.complete {
                                return Ok(Outcome::Completed);
                            }
                        }
                        Ok(RecognizerMessage::Metadata { request_id }) => {
                            debug!("stt#{} metadata (request {:?})", id, request_id);
                        }
                        Ok(RecognizerMessage::Unknown) => {
                            debug!("stt#{} ignoring message: {}", id, text.as_str());
                        }
                        Err(e) => {
                            warn!("stt#{} unparseable message: {} - {}", id, e, text.as_str());
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame.filter(|f| !is_normal_close(u16::from(f.code))) {
                        let code = u16::from(frame.code);
                        return Err(Error::upstream(SERVICE, format!("closed with {}: {}", code, frame.reason)));
                    }
                    return Ok(Outcome::UpstreamClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(Outcome::UpstreamClosed),
            }
        }
    }
}

fn is_normal_close(code: u16) -> bool {
    code == 1000 || code == 1001
}

async fn forward(sink: &mut WsSink, command: Command, input_open: &mut bool) -> Result<Flow> {
    match command {
        Command::Audio(audio) if *input_open => sink.send(Message::Binary(audio)).await?,
        Command::Audio(_) => debug!("Dropping audio sent after end of input"),
        Command::Finish if *input_open => {
            *input_open = false;
            sink.send(Message::text(CLOSE_STREAM.to_string())).await?;
        }
        Command::Finish => {}
        Command::Terminate => return Ok(Flow::Stop),
    }
    Ok(Flow::Continue)
}
