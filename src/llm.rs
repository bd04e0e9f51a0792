//! Response generation
//!
//! Sends the conversation to a chat-completions endpoint with `stream: true`
//! and forwards each content delta as soon as its SSE line is complete.

use crate::config::LlmConfig;
use crate::conversation::{ConversationMessage, Role};
use crate::error::{Error, Result};
use crate::queue::{self, QueueReader, QueueWriter};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SERVICE: &str = "language-model";

/// Streamed reply fragments. An `Err` item is the last item of the sequence.
pub type TokenStream = QueueReader<Result<String>>;

/// Produces a streamed reply for a conversation.
pub trait LanguageModel: Send + Sync + 'static {
    /// Start generating. Returns immediately; fragments arrive on the stream.
    /// Firing `cancel` ends the stream and releases the request.
    fn stream_reply(&self, history: Vec<ConversationMessage>, cancel: CancellationToken)
        -> TokenStream;
}

/// OpenAI-compatible chat-completions client
pub struct ChatCompletions {
    client: reqwest::Client,
    config: LlmConfig,
    connect_timeout: Duration,
}

impl ChatCompletions {
    pub fn new(config: LlmConfig, connect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            connect_timeout,
        }
    }

    fn request_body(&self, history: &[ConversationMessage]) -> Value {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(json!({ "role": "system", "content": self.config.system_prompt }));
        messages.extend(history.iter().map(message_json));
        json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        })
    }
}

impl LanguageModel for ChatCompletions {
    fn stream_reply(
        &self,
        history: Vec<ConversationMessage>,
        cancel: CancellationToken,
    ) -> TokenStream {
        let (tx, rx) = queue::channel();
        let request = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(&history));
        let timeout = self.connect_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Reply generation cancelled");
                }
                result = pump(request, &tx, timeout) => {
                    if let Err(e) = result {
                        warn!("Reply generation failed: {}", e);
                        tx.write(Err(e));
                    }
                }
            }
            tx.close();
        });

        rx
    }
}

fn message_json(message: &ConversationMessage) -> Value {
    match message.role {
        Role::Assistant => json!({ "role": "assistant", "content": message.content }),
        Role::User if message.attachments.is_empty() => {
            json!({ "role": "user", "content": message.content })
        }
        Role::User => {
            let mut parts: Vec<Value> = message
                .attachments
                .iter()
                .map(|image| {
                    json!({
                        "type": "image_url",
                        "image_url": { "url": image.0, "detail": "low" },
                    })
                })
                .collect();
            parts.push(json!({ "type": "text", "text": message.content }));
            json!({ "role": "user", "content": parts })
        }
    }
}

async fn pump(
    request: reqwest::RequestBuilder,
    tx: &QueueWriter<Result<String>>,
    timeout: Duration,
) -> Result<()> {
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| Error::setup(SERVICE, format!("timed out after {}ms", timeout.as_millis())))?
        .map_err(|e| Error::setup(SERVICE, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::upstream(SERVICE, format!("{status}: {body}")));
    }

    let mut first = true;
    let mut parser = SseParser::default();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        for event in parser.push(&chunk?)? {
            match event {
                SseEvent::Delta(text) => {
                    if first {
                        info!("🧠 First reply token");
                        first = false;
                    }
                    tx.write(Ok(text));
                }
                SseEvent::Done => return Ok(()),
            }
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental `text/event-stream` decoder. Lines are split on raw bytes so
/// multi-byte characters spanning network chunks stay intact.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(error) = chunk.error {
                        return Err(Error::upstream(SERVICE, error));
                    }
                    if let Some(content) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                    {
                        if !content.is_empty() {
                            events.push(SseEvent::Delta(content));
                        }
                    }
                }
                Err(e) => debug!("Skipping unparseable SSE line: {} - data: {}", e, data),
            }
        }
        Ok(events)
    }
}
