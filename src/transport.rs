//! Duplex websocket transport for upstream services
//!
//! Both the speech-to-text and speech-synthesis services speak JSON and binary
//! frames over a websocket. A [`Dialer`] opens one connection and hands back
//! the split sink/stream halves, so each component can run its own receive loop
//! while writing from the control side.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

/// Write half of an upstream connection
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of an upstream connection
pub type WsSource = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

/// An open upstream connection
pub struct Duplex {
    pub sink: WsSink,
    pub source: WsSource,
}

/// Opens upstream connections for one service.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Human readable service name, used in errors and logs
    fn service(&self) -> &'static str;

    async fn dial(&self) -> Result<Duplex>;
}

/// Dial with an upper bound on setup time. Every failure maps to a
/// connection setup error.
pub async fn dial_with_timeout(dialer: &dyn Dialer, timeout: Duration) -> Result<Duplex> {
    match tokio::time::timeout(timeout, dialer.dial()).await {
        Ok(Ok(duplex)) => Ok(duplex),
        Ok(Err(e @ Error::ConnectionSetup { .. })) => Err(e),
        Ok(Err(e)) => Err(Error::setup(dialer.service(), e)),
        Err(_) => Err(Error::setup(
            dialer.service(),
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Real websocket dialer backed by tokio-tungstenite
pub struct WsDialer {
    service: &'static str,
    url: String,
    headers: Vec<(HeaderName, String)>,
}

impl WsDialer {
    pub fn new(service: &'static str, url: impl Into<String>) -> Self {
        Self {
            service,
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

#[async_trait]
impl Dialer for WsDialer {
    fn service(&self) -> &'static str {
        self.service
    }

    async fn dial(&self) -> Result<Duplex> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::setup(self.service, format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name.clone(), value);
        }

        debug!("Connecting to {}", self.service);
        let (ws_stream, resp) = connect_async(request)
            .await
            .map_err(|e| Error::setup(self.service, e))?;
        info!("{} connected (status {})", self.service, resp.status());

        let (sink, stream) = ws_stream.split();
        Ok(Duplex {
            sink: Box::pin(sink),
            source: Box::pin(stream),
        })
    }
}
