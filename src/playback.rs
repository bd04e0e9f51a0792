//! Playback registry
//!
//! Maps a turn id to the queue of audio frames it produces, so an HTTP client
//! can pull the same audio the control socket would stream. A stream can be
//! claimed once. Entries disappear when their audio has been read to the end,
//! or when they sit untouched for longer than the idle timeout.

use crate::queue::{self, QueueReader, QueueWriter};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

struct Entry {
    reader: Option<QueueReader<Bytes>>,
    touched: Instant,
}

pub struct PlaybackRegistry {
    entries: DashMap<String, Entry>,
    idle_timeout: Duration,
}

impl PlaybackRegistry {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            idle_timeout,
        })
    }

    /// Create the audio queue for `id` and return its writing half.
    pub fn register(self: &Arc<Self>, id: &str) -> QueueWriter<Bytes> {
        let (writer, reader) = queue::channel();
        let registry = Arc::downgrade(self);
        let key = id.to_string();
        reader.on_drained(move || {
            if let Some(registry) = registry.upgrade() {
                registry.entries.remove(&key);
                debug!("Playback {} drained", key);
            }
        });
        self.entries.insert(
            id.to_string(),
            Entry {
                reader: Some(reader),
                touched: Instant::now(),
            },
        );
        writer
    }

    /// Take the reader for `id`. `None` if unknown, evicted or already claimed.
    pub fn claim(&self, id: &str) -> Option<QueueReader<Bytes>> {
        let mut entry = self.entries.get_mut(id)?;
        entry.touched = Instant::now();
        entry.reader.take()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Drop every entry idle for longer than the timeout.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let timeout = self.idle_timeout;
        self.entries.retain(|id, entry| {
            let keep = entry.touched.elapsed() < timeout;
            if !keep {
                debug!("Evicting idle playback {}", id);
            }
            keep
        });
        before.saturating_sub(self.entries.len())
    }

    /// Sweep periodically until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
