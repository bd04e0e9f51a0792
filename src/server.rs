//! HTTP surface: the control socket, playback downloads and a liveness probe.

use crate::config::Config;
use crate::error::Error;
use crate::llm::ChatCompletions;
use crate::playback::PlaybackRegistry;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{ConversationSession, Services};
use crate::session_runner::{self, ClientEvent};
use crate::stt;
use crate::stt_pool::SpeechRecognitionPool;
use crate::transport::WsDialer;
use crate::tts::{self, SpeechSynthesizer};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const PLAYBACK_FILE_NAME: &str = "speech.pcm";

#[derive(Clone)]
pub struct AppState {
    services: Services,
    content_type: Arc<str>,
}

impl AppState {
    pub fn new(services: Services, content_type: impl Into<Arc<str>>) -> Self {
        Self {
            services,
            content_type: content_type.into(),
        }
    }

    /// Wire the real upstream services. Starts warming the recognition pool,
    /// so it must run inside the runtime.
    pub fn from_config(config: &Config) -> Self {
        let stt_dialer = WsDialer::new(stt::SERVICE, config.stt.url.clone())
            .with_header(AUTHORIZATION, format!("Token {}", config.stt.api_key));
        let tts_url = format!(
            "{}?api_key={}&cartesia_version={}",
            config.tts.url, config.tts.api_key, config.tts.api_version
        );
        let tts_dialer = WsDialer::new(tts::SERVICE, tts_url);

        let services = Services {
            stt_pool: Arc::new(SpeechRecognitionPool::new(
                Arc::new(stt_dialer),
                config.stt.clone(),
                config.connect_timeout,
            )),
            model: Arc::new(ChatCompletions::new(config.llm.clone(), config.connect_timeout)),
            synthesizer: Arc::new(SpeechSynthesizer::new(
                Arc::new(tts_dialer),
                config.tts.clone(),
                config.connect_timeout,
            )),
            playback: PlaybackRegistry::new(config.playback_idle_timeout),
        };
        Self::new(services, config.tts.content_type())
    }

    pub fn playback(&self) -> &Arc<PlaybackRegistry> {
        &self.services.playback
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/sockets/chat", get(chat_upgrade))
        .route("/playback/{id}", get(playback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness() -> &'static str {
    "talkback is running"
}

async fn chat_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.services))
}

async fn handle_socket(socket: WebSocket, services: Services) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<ClientEvent>();

    let (session, events) = ConversationSession::new(services, out_tx);
    let session_id = session.id().to_string();
    info!("🔌 [{}] control socket connected", session_id);

    // Single writer: every producer goes through the channel
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize {:?}: {}", message, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => {
                            if in_tx.send(ClientEvent::Message(message)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Malformed client message: {} - {}", e, text.as_str()),
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Control socket read failed: {}", e);
                    let _ = in_tx.send(ClientEvent::Failed(Error::ClientDisconnected));
                    return;
                }
            }
        }
        let _ = in_tx.send(ClientEvent::Closed);
    });

    let session = session_runner::run(session, events, in_rx).await;
    reader.abort();
    // Drop the session's sender so the writer can flush and hang up
    drop(session);
    let _ = writer.await;
    info!("🔌 [{}] control socket closed", session_id);
}

async fn playback(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(audio) = state.services.playback.claim(&id) else {
        debug!("Playback {} not found", id);
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    info!("▶️ Streaming playback {}", id);
    let body = Body::from_stream(audio.into_stream().map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, state.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{PLAYBACK_FILE_NAME}\""),
            ),
        ],
        body,
    )
        .into_response()
}
