//! Session runner - feeds client messages and sub-stream events to the
//! session state machine, one at a time, until the session ends.

use crate::error::Error;
use crate::protocol::ClientMessage;
use crate::session::{ConversationSession, SessionEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the socket reader reports
#[derive(Debug)]
pub enum ClientEvent {
    Message(ClientMessage),
    /// The client closed the socket
    Closed,
    /// The socket broke
    Failed(Error),
}

/// Run the session until the client leaves or the session fails.
pub async fn run(
    mut session: ConversationSession,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut client: mpsc::UnboundedReceiver<ClientEvent>,
) -> ConversationSession {
    info!("Session runner started for {}", session.id());

    loop {
        tokio::select! {
            event = client.recv() => match event {
                Some(ClientEvent::Message(message)) => session.on_client(message),
                Some(ClientEvent::Failed(error)) => {
                    warn!("[{}] {}", session.id(), error);
                    session.on_disconnect().await;
                }
                Some(ClientEvent::Closed) | None => {
                    debug!("[{}] client socket closed", session.id());
                    session.on_disconnect().await;
                }
            },
            Some(event) = events.recv() => session.on_event(event),
        }

        if session.is_finished() {
            break;
        }
    }

    info!(
        "Session runner for {} stopped in {} with {} messages",
        session.id(),
        session.state_name(),
        session.history().len()
    );
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SttConfig, TtsConfig};
    use crate::playback::PlaybackRegistry;
    use crate::protocol::ServerMessage;
    use crate::session::Services;
    use crate::stt;
    use crate::stt_pool::SpeechRecognitionPool;
    use crate::testing::{FakeModel, ScriptedDialer};
    use crate::tts::{self, SpeechSynthesizer};
    use std::sync::Arc;
    use std::time::Duration;

    fn services() -> Services {
        let timeout = Duration::from_secs(1);
        let stt_config = SttConfig {
            pool_size: 1,
            ..SttConfig::default()
        };
        Services {
            stt_pool: Arc::new(SpeechRecognitionPool::new(
                Arc::new(ScriptedDialer::new(stt::SERVICE, |peer| peer.drain())),
                stt_config,
                timeout,
            )),
            model: Arc::new(FakeModel::new(&["Hi"])),
            synthesizer: Arc::new(SpeechSynthesizer::new(
                Arc::new(ScriptedDialer::failing(tts::SERVICE)),
                TtsConfig::default(),
                timeout,
            )),
            playback: PlaybackRegistry::new(Duration::from_secs(60)),
        }
    }

    #[tokio::test]
    async fn test_runner_stops_when_client_closes() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (session, events) = ConversationSession::new(services(), server_tx);
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(run(session, events, client_rx));

        client_tx
            .send(ClientEvent::Message(ClientMessage::StartUploadStream))
            .unwrap();
        client_tx.send(ClientEvent::Closed).unwrap();

        let session = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.state_name(), "CLOSED");
        assert_eq!(server_rx.recv().await.unwrap(), ServerMessage::Ready);
        assert_eq!(
            server_rx.recv().await.unwrap(),
            ServerMessage::StartUploadStreamResult { success: true }
        );
    }

    #[tokio::test]
    async fn test_runner_stops_when_reader_goes_away() {
        let (server_tx, _server_rx) = mpsc::unbounded_channel();
        let (session, events) = ConversationSession::new(services(), server_tx);
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        drop(client_tx);

        let session = tokio::time::timeout(Duration::from_secs(1), run(session, events, client_rx))
            .await
            .unwrap();
        assert!(session.is_finished());
    }
}
