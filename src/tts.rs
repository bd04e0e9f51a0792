//! Speech synthesis streaming
//!
//! Turns a live token stream into live audio under one synthesis context:
//!
//! 1. Tokens accumulate until a line break; each complete line goes upstream
//!    as a `continue` segment so prosody carries across sentences.
//! 2. When the tokens end, whatever is left (possibly nothing) is sent as the
//!    final segment, which closes the context.
//! 3. Audio chunks are re-cut into fixed-size frames; word timestamps become
//!    captions as soon as they arrive.
//!
//! The output is one [`SynthesisStream`] ending with exactly one terminal
//! event, `Finished` or `Failed`. Cancellation ends it with neither.

use crate::config::TtsConfig;
use crate::conversation::Caption;
use crate::error::{Error, Result};
use crate::llm::TokenStream;
use crate::queue::{self, QueueReader, QueueWriter};
use crate::transport::{self, Dialer, Duplex, WsSink};
use base64::engine::general_purpose;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const SERVICE: &str = "speech-synthesis";

/// Everything a synthesis turn produces
#[derive(Debug)]
pub enum SynthesisEvent {
    /// One re-chunked audio frame
    Audio(Bytes),
    /// Captions for words in audio that has been or is about to be emitted
    Captions(Vec<Caption>),
    /// Normal completion, carrying the full text that was synthesized
    Finished { text: String },
    /// The turn failed; nothing follows
    Failed(Error),
}

pub type SynthesisStream = QueueReader<SynthesisEvent>;

/// Splits streamed text into complete lines.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    pending: String,
}

impl SentenceSegmenter {
    /// Feed a token and take every line it completes. Each returned line
    /// carries a trailing space so segments join naturally upstream.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.pending.push_str(token);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find(['\r', '\n']) {
            let line = self.pending[..pos].to_string();
            let rest = self.pending[pos..].trim_start_matches(['\r', '\n']).to_string();
            self.pending = rest;
            if !line.trim().is_empty() {
                lines.push(format!("{line} "));
            }
        }
        lines
    }

    /// Take the unterminated remainder. May be empty.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Re-cuts arbitrary audio chunks into frames of exactly `frame_size` bytes.
#[derive(Debug)]
pub struct FrameRechunker {
    frame_size: usize,
    buffer: BytesMut,
}

impl FrameRechunker {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_size {
            frames.push(self.buffer.split_to(self.frame_size).freeze());
        }
        frames
    }

    /// Flush the short final frame, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }
}

#[derive(Serialize)]
struct Voice<'a> {
    mode: &'static str,
    id: &'a str,
}

#[derive(Serialize)]
struct OutputFormat {
    container: &'static str,
    encoding: &'static str,
    sample_rate: u32,
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    model_id: &'a str,
    voice: Voice<'a>,
    transcript: &'a str,
    context_id: &'a str,
    #[serde(rename = "continue")]
    more: bool,
    add_timestamps: bool,
    output_format: OutputFormat,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SynthesisMessage {
    Chunk {
        data: String,
    },
    Timestamps {
        word_timestamps: WordTimestamps,
    },
    Done {
        #[serde(default)]
        context_id: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WordTimestamps {
    words: Vec<String>,
    start: Vec<f64>,
    end: Vec<f64>,
}

impl WordTimestamps {
    fn into_captions(self) -> Vec<Caption> {
        let to_ms = |secs: f64| (secs.max(0.0) * 1000.0).round() as u64;
        self.words
            .into_iter()
            .zip(self.start)
            .zip(self.end)
            .map(|((word, start), end)| Caption::new(word, to_ms(start), to_ms(end)))
            .collect()
    }
}

/// Starts synthesis turns against one speech synthesis service.
pub struct SpeechSynthesizer {
    dialer: Arc<dyn Dialer>,
    config: TtsConfig,
    connect_timeout: Duration,
}

impl SpeechSynthesizer {
    pub fn new(dialer: Arc<dyn Dialer>, config: TtsConfig, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            config,
            connect_timeout,
        }
    }

    /// Synthesize `tokens` under `context_id`. Returns at once.
    pub fn stream(
        &self,
        context_id: String,
        tokens: TokenStream,
        cancel: CancellationToken,
    ) -> SynthesisStream {
        let (out, stream) = queue::channel();
        let turn = Turn {
            dialer: self.dialer.clone(),
            config: self.config.clone(),
            connect_timeout: self.connect_timeout,
            context_id,
        };
        tokio::spawn(async move {
            match turn.run(tokens, &cancel, &out).await {
                Ok(text) => {
                    info!("🔊 Synthesis {} finished", turn.context_id);
                    out.write(SynthesisEvent::Finished { text });
                }
                Err(Error::Cancelled) => debug!("Synthesis {} cancelled", turn.context_id),
                Err(e) => {
                    warn!("Synthesis {} failed: {}", turn.context_id, e);
                    out.write(SynthesisEvent::Failed(e));
                }
            }
            out.close();
        });
        stream
    }
}

struct Turn {
    dialer: Arc<dyn Dialer>,
    config: TtsConfig,
    connect_timeout: Duration,
    context_id: String,
}

impl Turn {
    async fn run(
        &self,
        mut tokens: TokenStream,
        cancel: &CancellationToken,
        out: &QueueWriter<SynthesisEvent>,
    ) -> Result<String> {
        let dialed = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            dialed = transport::dial_with_timeout(self.dialer.as_ref(), self.connect_timeout) => dialed,
        };
        let Duplex {
            mut sink,
            mut source,
        } = dialed?;

        let mut segmenter = SentenceSegmenter::default();
        let mut rechunker = FrameRechunker::new(self.config.frame_size);
        let mut text = String::new();
        let mut tokens_done = false;
        let mut subscribed = false;
        let mut first_audio = true;

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(Error::Cancelled),
                token = tokens.next(), if !tokens_done => match token {
                    Some(Ok(token)) => {
                        text.push_str(&token);
                        let lines = segmenter.push(&token);
                        subscribed |= !lines.is_empty();
                        if let Err(e) = self.send_lines(&mut sink, &lines).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        tokens_done = true;
                        let rest = segmenter.finish();
                        if let Err(e) = self.send_segment(&mut sink, &rest, false).await {
                            break Err(e);
                        }
                        subscribed = true;
                    }
                },
                frame = source.next(), if subscribed => match frame {
                    Some(Ok(Message::Text(raw))) => {
                        match serde_json::from_str::<SynthesisMessage>(raw.as_str()) {
                            Ok(SynthesisMessage::Chunk { data }) => {
                                let audio = match general_purpose::STANDARD.decode(data.as_bytes()) {
                                    Ok(audio) => audio,
                                    Err(e) => break Err(Error::upstream(SERVICE, format!("bad audio payload: {e}"))),
                                };
                                if first_audio {
                                    info!("🔊 First audio for {}", self.context_id);
                                    first_audio = false;
                                }
                                for frame in rechunker.push(&audio) {
                                    out.write(SynthesisEvent::Audio(frame));
                                }
                            }
                            Ok(SynthesisMessage::Timestamps { word_timestamps }) => {
                                let captions = word_timestamps.into_captions();
                                debug!("Captions: {:?}", captions.iter().map(|c| c.text.as_str()).collect::<Vec<_>>());
                                out.write(SynthesisEvent::Captions(captions));
                            }
                            Ok(SynthesisMessage::Done { .. }) => {
                                if let Some(frame) = rechunker.finish() {
                                    out.write(SynthesisEvent::Audio(frame));
                                }
                                break Ok(());
                            }
                            Ok(SynthesisMessage::Error { error, status_code }) => {
                                let message = error.unwrap_or_else(|| "unknown error".to_string());
                                let message = match status_code {
                                    Some(code) => format!("{code}: {message}"),
                                    None => message,
                                };
                                break Err(Error::upstream(SERVICE, message));
                            }
                            Ok(SynthesisMessage::Unknown) => {
                                debug!("Ignoring synthesis message: {}", raw.as_str());
                            }
                            Err(e) => warn!("Unparseable synthesis message: {} - {}", e, raw.as_str()),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(Error::upstream(SERVICE, "connection closed before done"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                }
            }
        };

        let _ = sink.close().await;
        result.map(|()| text)
    }

    async fn send_lines(&self, sink: &mut WsSink, lines: &[String]) -> Result<()> {
        for line in lines {
            self.send_segment(sink, line, true).await?;
        }
        Ok(())
    }

    async fn send_segment(&self, sink: &mut WsSink, transcript: &str, more: bool) -> Result<()> {
        debug!(">> Synthesizing {:?} (continue={})", transcript, more);
        let request = SegmentRequest {
            model_id: &self.config.model_id,
            voice: Voice {
                mode: "id",
                id: &self.config.voice_id,
            },
            transcript,
            context_id: &self.context_id,
            more,
            add_timestamps: true,
            output_format: OutputFormat {
                container: "raw",
                encoding: "pcm_f32le",
                sample_rate: self.config.sample_rate,
            },
        };
        sink.send(Message::text(serde_json::to_string(&request)?)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedDialer;
    use serde_json::json;

    fn tokens(fragments: &[&str]) -> TokenStream {
        let (tx, rx) = queue::channel();
        for fragment in fragments {
            tx.write(Ok(fragment.to_string()));
        }
        tx.close();
        rx
    }

    fn synthesizer(dialer: ScriptedDialer, frame_size: usize) -> SpeechSynthesizer {
        let config = TtsConfig {
            frame_size,
            ..TtsConfig::default()
        };
        SpeechSynthesizer::new(Arc::new(dialer), config, Duration::from_secs(1))
    }

    fn chunk(bytes: &[u8]) -> serde_json::Value {
        json!({ "type": "chunk", "data": general_purpose::STANDARD.encode(bytes), "done": false })
    }

    async fn collect(mut stream: SynthesisStream) -> Vec<SynthesisEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_segmenter_splits_lines() {
        let mut segmenter = SentenceSegmenter::default();
        assert_eq!(segmenter.push("Hello there.\nHow"), vec!["Hello there. "]);
        assert!(segmenter.push(" are").is_empty());
        assert_eq!(segmenter.push(" you?\r\n\nFine"), vec!["How are you? "]);
        assert_eq!(segmenter.finish(), "Fine");
        assert_eq!(segmenter.finish(), "");
    }

    #[test]
    fn test_segmenter_line_break_in_first_fragment() {
        let mut segmenter = SentenceSegmenter::default();
        assert_eq!(segmenter.push("Hi.\n"), vec!["Hi. "]);
        assert_eq!(segmenter.finish(), "");
    }

    #[test]
    fn test_segmenter_break_split_across_tokens() {
        let mut segmenter = SentenceSegmenter::default();
        assert_eq!(segmenter.push("One.\r"), vec!["One. "]);
        assert!(segmenter.push("\nTwo.").is_empty());
        assert_eq!(segmenter.finish(), "Two.");
    }

    #[test]
    fn test_rechunker_preserves_bytes_and_frame_size() {
        let input: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for frame_size in [1, 4, 7, 64, 999, 1000, 4096] {
            for cut in [1, 3, 50, 333, 1000] {
                let mut rechunker = FrameRechunker::new(frame_size);
                let mut frames = Vec::new();
                for piece in input.chunks(cut) {
                    frames.extend(rechunker.push(piece));
                }
                let full_frames = frames.len();
                frames.extend(rechunker.finish());

                assert!(frames[..full_frames].iter().all(|f| f.len() == frame_size));
                if let Some(last) = frames.last() {
                    assert!(last.len() <= frame_size);
                }
                let joined: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
                assert_eq!(joined, input);
            }
        }
    }

    #[test]
    fn test_timestamps_become_captions() {
        let stamps = WordTimestamps {
            words: vec!["hi".into(), "there".into()],
            start: vec![0.0, 0.5],
            end: vec![0.5, 1.5],
        };
        assert_eq!(
            stamps.into_captions(),
            vec![Caption::new("hi", 0, 500), Caption::new("there", 500, 1500)]
        );
    }

    #[tokio::test]
    async fn test_segments_sent_with_continue_flags() {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let dialer = ScriptedDialer::new(SERVICE, move |mut peer| {
            let seen_tx = seen_tx.clone();
            async move {
                while let Some(request) = peer.next_json().await {
                    let last = request["continue"] == false;
                    let _ = seen_tx.send(request);
                    if last {
                        peer.send_json(json!({ "type": "done", "done": true }));
                    }
                }
            }
        });

        let stream = synthesizer(dialer, 8).stream(
            "ctx-1".into(),
            tokens(&["Hello.\nWorld", " again.\n"]),
            CancellationToken::new(),
        );
        let events = collect(stream).await;

        let sent: Vec<serde_json::Value> = std::iter::from_fn(|| seen_rx.try_recv().ok()).collect();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0]["transcript"], "Hello. ");
        assert_eq!(sent[0]["continue"], true);
        assert_eq!(sent[0]["context_id"], "ctx-1");
        assert_eq!(sent[0]["add_timestamps"], true);
        assert_eq!(sent[0]["output_format"]["encoding"], "pcm_f32le");
        assert_eq!(sent[1]["transcript"], "World again. ");
        assert_eq!(sent[2]["transcript"], "");
        assert_eq!(sent[2]["continue"], false);

        match events.last() {
            Some(SynthesisEvent::Finished { text }) => assert_eq!(text, "Hello.\nWorld again.\n"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_audio_rechunked_and_flushed_on_done() {
        let dialer = ScriptedDialer::new(SERVICE, |mut peer| async move {
            while let Some(request) = peer.next_json().await {
                if request["continue"] == false {
                    peer.send_json(json!({
                        "type": "timestamps",
                        "word_timestamps": { "words": ["hi"], "start": [0.0], "end": [0.25] },
                    }));
                    peer.send_json(chunk(&[1, 2, 3, 4, 5, 6]));
                    peer.send_json(chunk(&[7, 8, 9, 10]));
                    peer.send_json(json!({ "type": "done", "done": true }));
                }
            }
        });

        let stream = synthesizer(dialer, 4).stream("ctx".into(), tokens(&["hi"]), CancellationToken::new());
        let events = collect(stream).await;

        let mut audio = Vec::new();
        let mut captions = Vec::new();
        for event in &events {
            match event {
                SynthesisEvent::Audio(frame) => audio.push(frame.to_vec()),
                SynthesisEvent::Captions(batch) => captions.extend(batch.clone()),
                _ => {}
            }
        }
        assert_eq!(audio, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]]);
        assert_eq!(captions, vec![Caption::new("hi", 0, 250)]);
        // Captions arrive before the audio they describe
        assert!(matches!(events[0], SynthesisEvent::Captions(_)));
        assert!(matches!(events.last(), Some(SynthesisEvent::Finished { .. })));
    }

    #[tokio::test]
    async fn test_error_is_terminal() {
        let dialer = ScriptedDialer::new(SERVICE, |mut peer| async move {
            while let Some(request) = peer.next_json().await {
                if request["continue"] == false {
                    peer.send_json(json!({ "type": "error", "error": "voice not found", "status_code": 400, "done": true }));
                    peer.send_json(json!({ "type": "done", "done": true }));
                }
            }
        });

        let stream = synthesizer(dialer, 4).stream("ctx".into(), tokens(&["hi"]), CancellationToken::new());
        let events = collect(stream).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            SynthesisEvent::Failed(Error::UpstreamProtocol { message, .. }) => {
                assert!(message.contains("voice not found"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_output_without_terminal_event() {
        let (hangup_tx, mut hangup_rx) = tokio::sync::mpsc::unbounded_channel();
        let dialer = ScriptedDialer::new(SERVICE, move |mut peer| {
            let hangup_tx = hangup_tx.clone();
            async move {
                if peer.next_json().await.is_some() {
                    peer.send_json(chunk(&[0; 8]));
                }
                // Keep reading until the synthesizer hangs up
                peer.drain().await;
                let _ = hangup_tx.send(());
            }
        });

        let (token_tx, token_rx) = queue::channel();
        token_tx.write(Ok("First line.\n".to_string()));
        let cancel = CancellationToken::new();
        let mut stream = synthesizer(dialer, 4).stream("ctx".into(), token_rx, cancel.clone());

        assert!(matches!(stream.next().await, Some(SynthesisEvent::Audio(_))));
        cancel.cancel();
        token_tx.write(Ok("Never sent.\n".to_string()));

        let rest = collect(stream).await;
        assert!(rest.iter().all(|e| matches!(e, SynthesisEvent::Audio(_))));
        assert!(rest.len() <= 1);
        hangup_rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported() {
        let stream = synthesizer(ScriptedDialer::failing(SERVICE), 4).stream(
            "ctx".into(),
            tokens(&["hi"]),
            CancellationToken::new(),
        );
        let events = collect(stream).await;
        assert!(matches!(
            events.as_slice(),
            [SynthesisEvent::Failed(Error::ConnectionSetup { .. })]
        ));
    }
}
