//! Pre-warmed speech recognition connections
//!
//! Opening a recognition websocket costs a TLS handshake and an auth round
//! trip. The pool keeps `size` connections dialing or ready so a new utterance
//! can start streaming audio at once. Connections are single-use: nothing is
//! ever returned to the pool.

use crate::config::SttConfig;
use crate::stt::SpeechRecognitionConnection;
use crate::transport::Dialer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct SpeechRecognitionPool {
    dialer: Arc<dyn Dialer>,
    config: SttConfig,
    connect_timeout: Duration,
    idle: Mutex<VecDeque<SpeechRecognitionConnection>>,
}

impl SpeechRecognitionPool {
    /// Create the pool and start warming `config.pool_size` connections.
    pub fn new(dialer: Arc<dyn Dialer>, config: SttConfig, connect_timeout: Duration) -> Self {
        let pool = Self {
            dialer,
            config,
            connect_timeout,
            idle: Mutex::new(VecDeque::new()),
        };
        pool.refill();
        pool
    }

    fn open(&self) -> SpeechRecognitionConnection {
        SpeechRecognitionConnection::open(self.dialer.clone(), &self.config, self.connect_timeout)
    }

    /// Check out a connection for exclusive use. Never waits on the network:
    /// when no idle connection is available a fresh one is opened.
    pub fn acquire(&self) -> SpeechRecognitionConnection {
        let pooled = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(conn) = idle.pop_front() {
                if conn.is_alive() {
                    found = Some(conn);
                    break;
                }
                debug!("Discarding dead pooled connection stt#{}", conn.id());
            }
            found
        };

        let conn = match pooled {
            Some(conn) => {
                debug!("Acquired pooled connection stt#{}", conn.id());
                conn
            }
            None => {
                let conn = self.open();
                debug!("Pool empty, opened stt#{}", conn.id());
                conn
            }
        };
        self.refill();
        conn
    }

    /// Top the pool back up. Opening only spawns the dial, so this is cheap.
    fn refill(&self) {
        let mut idle = self.idle.lock();
        while idle.len() < self.config.pool_size {
            idle.push_back(self.open());
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
