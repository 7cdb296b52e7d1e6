//! Event bus broadcasting element status to listeners.
//!
//! Every element posts its state transitions, errors and custom
//! messages to a single shared [`EventBus`]. Posting is non-blocking —
//! the posting worker also owns time-critical data movement, so the bus
//! must never stall it. Each listener has its own bounded queue and
//! observes every message, in post order (broadcast, not work-stealing).
//!
//! Queue overflow is an explicit configuration choice
//! ([`OverflowPolicy`]), defaulting to rejecting the new message.

use crate::element::State;
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Default per-listener queue capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// What `post` does when a listener queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the message being posted; queued messages survive.
    #[default]
    RejectNew,
    /// Evict the oldest queued message to make room.
    DropOldest,
}

/// Payload of a bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// An element changed state.
    StateChanged {
        /// State before the transition.
        from: State,
        /// State after the transition.
        to: State,
    },
    /// An element's processing callback failed.
    Error {
        /// Human-readable description of the fault.
        message: String,
    },
    /// Application-defined message posted by a stage.
    Custom {
        /// Opaque discriminator chosen by the stage.
        tag: u32,
        /// Small inline value.
        value: i64,
    },
}

/// A message carried by the event bus.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Tag of the originating element.
    pub source: String,
    /// What happened.
    pub kind: EventKind,
    /// Monotonically increasing sequence number, assigned at the bus's
    /// single enqueue point. Replay-free ordering across elements.
    pub seq: u64,
}

struct ListenerSlot {
    id: u64,
    tx: Sender<BusEvent>,
    /// Receiver clone kept for the drop-oldest policy; also keeps the
    /// channel alive until the listener is unsubscribed.
    rx: Receiver<BusEvent>,
}

struct BusInner {
    listeners: Mutex<Vec<ListenerSlot>>,
    seq: AtomicU64,
    next_id: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
}

/// Shared, cheap-to-clone handle to the event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default capacity and reject-new overflow.
    pub fn new() -> Self {
        Self::with_policy(DEFAULT_BUS_CAPACITY, OverflowPolicy::default())
    }

    /// Create a bus with an explicit queue capacity and overflow policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "event bus capacity must be non-zero");
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                capacity,
                policy,
            }),
        }
    }

    /// Register a new listener.
    ///
    /// The listener observes every message posted after subscription.
    pub fn subscribe(&self) -> BusListener {
        let (tx, rx) = bounded(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.inner.listeners.lock().unwrap();
        listeners.push(ListenerSlot {
            id,
            tx,
            rx: rx.clone(),
        });
        BusListener { id, rx }
    }

    /// Detach a listener. Fails loudly if it is not attached.
    pub fn unsubscribe(&self, listener: &BusListener) -> Result<()> {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|slot| slot.id != listener.id);
        if listeners.len() == before {
            return Err(Error::Lifecycle(format!(
                "listener {} is not attached to this bus",
                listener.id
            )));
        }
        Ok(())
    }

    /// Post a message. Never blocks and never fails.
    ///
    /// A full listener queue is handled per the bus's
    /// [`OverflowPolicy`]; dropped messages are counted and logged.
    pub fn post(&self, source: &str, kind: EventKind) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let event = BusEvent {
            source: source.to_string(),
            kind,
            seq,
        };
        let listeners = self.inner.listeners.lock().unwrap();
        for slot in listeners.iter() {
            let mut pending = event.clone();
            if self.inner.policy == OverflowPolicy::DropOldest {
                if let Err(TrySendError::Full(back)) = slot.tx.try_send(pending) {
                    // Evict one, then retry once.
                    let _ = slot.rx.try_recv();
                    pending = back;
                    if slot.tx.try_send(pending).is_err() {
                        self.count_drop(source, slot.id);
                    }
                    continue;
                }
            } else if slot.tx.try_send(pending).is_err() {
                self.count_drop(source, slot.id);
            }
        }
    }

    /// Number of messages dropped due to full listener queues.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    fn count_drop(&self, source: &str, listener: u64) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(source, listener, "event dropped: listener queue full");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("policy", &self.inner.policy)
            .field("listeners", &self.listener_count())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Receiving side of a bus subscription.
pub struct BusListener {
    id: u64,
    rx: Receiver<BusEvent>,
}

impl BusListener {
    /// Wait for the next message.
    ///
    /// `timeout` of `None` blocks until a message arrives or the bus
    /// shuts down; `Some` bounds the wait and returns
    /// [`Error::Timeout`] on expiry.
    pub fn listen(&self, timeout: Option<Duration>) -> Result<BusEvent> {
        match timeout {
            None => self.rx.recv().map_err(|_| Error::BusClosed),
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::BusClosed,
            }),
        }
    }

    /// Take the next message without blocking, if one is queued.
    pub fn try_listen(&self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every currently queued message.
    pub fn drain(&self) -> Vec<BusEvent> {
        std::iter::from_fn(|| self.try_listen()).collect()
    }
}

impl std::fmt::Debug for BusListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusListener")
            .field("id", &self.id)
            .field("queued", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_listen() {
        let bus = EventBus::new();
        let listener = bus.subscribe();

        bus.post("src", EventKind::Custom { tag: 7, value: 42 });

        let event = listener.listen(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(event.source, "src");
        assert_eq!(event.kind, EventKind::Custom { tag: 7, value: 42 });
    }

    #[test]
    fn test_broadcast_reaches_every_listener() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.post("x", EventKind::Custom { tag: 1, value: 1 });

        assert!(a.try_listen().is_some());
        assert!(b.try_listen().is_some());
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let bus = EventBus::new();
        let listener = bus.subscribe();

        for i in 0..10 {
            bus.post("x", EventKind::Custom { tag: 0, value: i });
        }

        let events = listener.drain();
        assert_eq!(events.len(), 10);
        for pair in events.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
    }

    #[test]
    fn test_listen_timeout() {
        let bus = EventBus::new();
        let listener = bus.subscribe();
        assert!(matches!(
            listener.listen(Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_reject_new_keeps_oldest() {
        let bus = EventBus::with_policy(2, OverflowPolicy::RejectNew);
        let listener = bus.subscribe();

        for i in 0..5 {
            bus.post("x", EventKind::Custom { tag: 0, value: i });
        }

        let events = listener.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
        assert_eq!(bus.dropped(), 3);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let bus = EventBus::with_policy(2, OverflowPolicy::DropOldest);
        let listener = bus.subscribe();

        for i in 0..5 {
            bus.post("x", EventKind::Custom { tag: 0, value: i });
        }

        let events = listener.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 3);
        assert_eq!(events[1].seq, 4);
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let bus = EventBus::new();
        let listener = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);

        bus.unsubscribe(&listener).unwrap();
        assert_eq!(bus.listener_count(), 0);
        // Detaching twice is a caller bug and fails loudly.
        assert!(bus.unsubscribe(&listener).is_err());
    }

    #[test]
    fn test_post_with_no_listeners_is_fine() {
        let bus = EventBus::new();
        bus.post("x", EventKind::Custom { tag: 0, value: 0 });
        assert_eq!(bus.dropped(), 0);
    }
}
