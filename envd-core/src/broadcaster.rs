//! Output fan-out: one pump (the process's stdout or stderr reader) feeding
//! many independent subscribers.
//!
//! Deliberately does not reuse `tokio::sync::broadcast`: that type's lag
//! semantics are global (one slow reader forces every reader to skip the
//! same dropped range, and a full ring buffer surfaces as a `Lagged` error
//! rather than a silent drop). This type gives every subscriber its own
//! bounded `mpsc` channel instead, so a slow subscriber only ever loses its
//! own bytes. Mirrors the subscriber-map-behind-a-mutex shape of the
//! original Go broadcaster.

use parking_lot::Mutex;
use tokio::sync::mpsc;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

struct Inner {
    subscribers: Vec<mpsc::Sender<Vec<u8>>>,
    closed: bool,
    capacity: usize,
}

/// Fan-out broadcaster for one stream of byte chunks (stdout or stderr of one
/// process). Safe to call `publish` and `subscribe` concurrently from
/// different tasks; `publish` never blocks.
pub struct Broadcaster {
    inner: Mutex<Inner>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                closed: false,
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Publishes one chunk to every current subscriber. A subscriber whose
    /// queue is full is dropped-from (the chunk is skipped for that
    /// subscriber only); the subscriber's channel itself stays open. A
    /// subscriber whose receiver has gone away is pruned from the registry.
    ///
    /// No-op once the broadcaster is closed.
    pub fn publish(&self, chunk: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.subscribers.retain_mut(|tx| match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Subscribes to future chunks. Subscribing after `close()` returns a
    /// receiver that is immediately closed (yields `None` right away)
    /// instead of one that would hang forever.
    pub fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::channel(inner.capacity);
        if inner.closed {
            // Drop tx immediately: rx observes a closed channel.
            return rx;
        }
        inner.subscribers.push(tx);
        rx
    }

    /// Closes the broadcaster: no further chunks are published, and all
    /// current subscriber channels are dropped so their receivers observe
    /// end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bcast = Broadcaster::new(4);
        let mut a = bcast.subscribe();
        let mut b = bcast.subscribe();

        bcast.publish(b"hello".to_vec());

        assert_eq!(a.recv().await, Some(b"hello".to_vec()));
        assert_eq!(b.recv().await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_affecting_others() {
        let bcast = Broadcaster::new(1);
        let mut slow = bcast.subscribe();
        let mut fast = bcast.subscribe();

        bcast.publish(b"one".to_vec());
        bcast.publish(b"two".to_vec()); // slow's queue (cap 1) is full, dropped

        // fast drained promptly keeps receiving everything.
        assert_eq!(fast.recv().await, Some(b"one".to_vec()));
        assert_eq!(fast.recv().await, Some(b"two".to_vec()));

        // slow only ever saw the first chunk; its channel is not closed.
        assert_eq!(slow.recv().await, Some(b"one".to_vec()));
        assert_eq!(bcast.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_streams() {
        let bcast = Broadcaster::new(4);
        let mut rx = bcast.subscribe();
        bcast.close();
        bcast.close();

        assert_eq!(rx.recv().await, None);
        assert!(bcast.is_closed());
    }

    #[tokio::test]
    async fn subscribe_after_close_is_immediately_closed() {
        let bcast = Broadcaster::new(4);
        bcast.close();

        let mut rx = bcast.subscribe();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bcast = Broadcaster::new(4);
        let rx = bcast.subscribe();
        drop(rx);

        bcast.publish(b"x".to_vec());
        assert_eq!(bcast.subscriber_count(), 0);
    }
}
