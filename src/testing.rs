//! In-process fakes for upstream services, used by unit tests.

use crate::conversation::ConversationMessage;
use crate::error::{Error, Result};
use crate::llm::{LanguageModel, TokenStream};
use crate::queue;
use crate::transport::{Dialer, Duplex};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

/// Far end of a scripted connection.
pub struct Peer {
    /// Frames the component under test sent upstream
    pub incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<std::result::Result<Message, WsError>>,
}

impl Peer {
    pub fn send_json(&self, value: Value) {
        let _ = self.outgoing.send(Ok(Message::Text(value.to_string().into())));
    }

    pub fn send_error(&self) {
        let _ = self.outgoing.send(Err(WsError::ConnectionClosed));
    }

    /// Next text frame parsed as JSON, skipping binary audio frames.
    pub async fn next_json(&mut self) -> Option<Value> {
        while let Some(message) = self.incoming.recv().await {
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).ok();
            }
        }
        None
    }

    /// Wait until a binary frame arrives.
    pub async fn next_binary(&mut self) -> Option<Vec<u8>> {
        while let Some(message) = self.incoming.recv().await {
            if let Message::Binary(bytes) = message {
                return Some(bytes.to_vec());
            }
        }
        None
    }

    /// Hold the connection open until the component hangs up.
    pub async fn drain(mut self) {
        while self.incoming.recv().await.is_some() {}
    }
}

type Script = Arc<dyn Fn(Peer) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dialer whose connections are driven by a test script.
pub struct ScriptedDialer {
    service: &'static str,
    script: Option<Script>,
    dial_delay: Duration,
}

impl ScriptedDialer {
    pub fn new<F, Fut>(service: &'static str, script: F) -> Self
    where
        F: Fn(Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Script = Arc::new(move |peer| script(peer).boxed());
        Self {
            service,
            script: Some(boxed),
            dial_delay: Duration::ZERO,
        }
    }

    pub fn failing(service: &'static str) -> Self {
        Self {
            service,
            script: None,
            dial_delay: Duration::ZERO,
        }
    }

    /// Delay every dial, to exercise work queued while connecting.
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    fn service(&self) -> &'static str {
        self.service
    }

    async fn dial(&self) -> Result<Duplex> {
        if !self.dial_delay.is_zero() {
            tokio::time::sleep(self.dial_delay).await;
        }
        let Some(script) = &self.script else {
            return Err(Error::setup(self.service, "connection refused"));
        };

        let (up_tx, up_rx) = mpsc::unbounded_channel::<Message>();
        let (down_tx, down_rx) = mpsc::unbounded_channel();

        let sink = futures_util::sink::unfold(up_tx, |tx, message: Message| async move {
            tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
            Ok::<_, WsError>(tx)
        });
        let source = futures_util::stream::unfold(down_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        tokio::spawn(script(Peer {
            incoming: up_rx,
            outgoing: down_tx,
        }));

        Ok(Duplex {
            sink: Box::pin(sink),
            source: Box::pin(source),
        })
    }
}

/// Language model that replays fixed fragments.
pub struct FakeModel {
    fragments: Vec<String>,
    delay: Duration,
    pub histories: Mutex<Vec<Vec<ConversationMessage>>>,
}

impl FakeModel {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            delay: Duration::ZERO,
            histories: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl LanguageModel for FakeModel {
    fn stream_reply(
        &self,
        history: Vec<ConversationMessage>,
        cancel: CancellationToken,
    ) -> TokenStream {
        self.histories.lock().push(history);
        let (tx, rx) = queue::channel();
        let fragments = self.fragments.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            for fragment in fragments {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => tx.write(Ok(fragment)),
                }
            }
            tx.close();
        });
        rx
    }
}
