//! Backpressure queue
//!
//! An unbounded single-producer/single-consumer buffer. The writer never
//! blocks; the reader awaits the next item and sees end-of-sequence exactly
//! once, after the writer closed the queue and every buffered item was read.
//!
//! The writer half is `Clone` so a producer task and its owner can both close
//! it; there is still only one logical producer per queue.

use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

type DrainHook = Box<dyn FnOnce() + Send + 'static>;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    reader_gone: bool,
    on_drained: Option<DrainHook>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

/// Create a connected writer/reader pair.
pub fn channel<T>() -> (QueueWriter<T>, QueueReader<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::new(),
            closed: false,
            reader_gone: false,
            on_drained: None,
        }),
        notify: Notify::new(),
    });
    (
        QueueWriter {
            shared: shared.clone(),
        },
        QueueReader {
            shared,
            finished: false,
        },
    )
}

/// Producing half.
pub struct QueueWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueWriter<T> {
    /// Append an item. A no-op once the queue is closed or the reader is gone.
    pub fn write(&self, item: T) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed || inner.reader_gone {
                return;
            }
            inner.items.push_back(item);
        }
        self.shared.notify.notify_one();
    }

    /// Mark the end of the sequence. Buffered items stay readable.
    pub fn close(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.shared.notify.notify_one();
    }
}

/// Consuming half. Only one exists per queue.
pub struct QueueReader<T> {
    shared: Arc<Shared<T>>,
    finished: bool,
}

impl<T> QueueReader<T> {
    /// Register a hook that runs once the last item has been read out of a
    /// closed queue. Runs at most once.
    pub fn on_drained(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.inner.lock().on_drained = Some(Box::new(hook));
    }

    /// Wait for the next item. `None` marks end-of-sequence; later calls keep
    /// returning `None`.
    pub async fn next(&mut self) -> Option<T> {
        if self.finished {
            return None;
        }
        loop {
            let hook = {
                let mut inner = self.shared.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    self.finished = true;
                    inner.on_drained.take()
                } else {
                    None
                }
            };
            if self.finished {
                if let Some(hook) = hook {
                    hook();
                }
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Consume the reader as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
    {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
    }
}

impl<T> Drop for QueueReader<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.reader_gone = true;
        inner.items.clear();
    }
}
