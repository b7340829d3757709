//! Per-resource admission queues.
//!
//! A [`ResourceSerializer`] keeps one FIFO queue per resource key. At most
//! one unit of work per key is admitted at a time; distinct keys never wait
//! on each other. Admission is represented by a [`SerializerPermit`] whose
//! drop releases the slot, so every exit path (success, error, panic,
//! cancellation) hands the key to the next waiter.
//!
//! Queues are created lazily on first reference and kept for the life of
//! the serializer. The device set is small and mostly static.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use tokio::sync::oneshot;

/// Queue entry. The head entry is the unit in flight; its sender has
/// already been consumed.
type Slot = Option<oneshot::Sender<()>>;

/// Named single-concurrency execution queues keyed by resource identity.
#[derive(Debug)]
pub struct ResourceSerializer {
    name: String,
    queues: Mutex<HashMap<String, VecDeque<Slot>>>,
}

/// Admission to run against one key. Dropping it admits the next waiter.
#[must_use = "the key is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct SerializerPermit<'a> {
    serializer: &'a ResourceSerializer,
    key: String,
}

impl Drop for SerializerPermit<'_> {
    fn drop(&mut self) {
        self.serializer.exit(&self.key);
    }
}

/// A waiter that has queued but not yet observed admission. If it is
/// dropped after admission was signalled, the slot is released on its
/// behalf.
struct Pending<'a> {
    serializer: &'a ResourceSerializer,
    key: String,
    rx: oneshot::Receiver<()>,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.rx.try_recv().is_ok() {
            self.serializer.exit(&self.key);
        }
    }
}

impl ResourceSerializer {
    /// Create an empty serializer. The name only appears in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue for `key` and wait until admitted.
    pub async fn enter(&self, key: &str) -> SerializerPermit<'_> {
        let rx = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(key.to_string()).or_default();
            if queue.is_empty() {
                queue.push_back(None);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                queue.push_back(Some(tx));
                tracing::debug!(
                    serializer = %self.name,
                    key = %key,
                    depth = queue.len(),
                    "queued behind in-flight operation"
                );
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let mut pending = Pending {
                serializer: self,
                key: key.to_string(),
                rx,
            };
            // The sender is only dropped unsent when the serializer itself
            // goes away, which cannot happen while we borrow it.
            let _ = (&mut pending.rx).await;
        }

        SerializerPermit {
            serializer: self,
            key: key.to_string(),
        }
    }

    /// Run `work` while holding the slot for `key`.
    pub async fn run<F, T>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.enter(key).await;
        work.await
    }

    /// Number of entries (in flight plus waiting) for `key`.
    pub fn depth(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Release the head of `key`'s queue and admit the next live waiter.
    fn exit(&self, key: &str) {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(key) else {
            tracing::warn!(serializer = %self.name, key = %key, "corruption: exit on unknown queue");
            return;
        };
        if queue.pop_front().is_none() {
            tracing::warn!(serializer = %self.name, key = %key, "corruption: exit on empty queue");
            return;
        }

        while let Some(head) = queue.front_mut() {
            match head.take() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // Waiter was cancelled before its turn.
                    queue.pop_front();
                }
                None => {
                    tracing::warn!(serializer = %self.name, key = %key, "corruption: second in-flight entry");
                    return;
                }
            }
        }
    }
}
