//! Connection state
//!
//! Each connection moves through `Connecting -> Active -> Closing -> Closed`
//! and never leaves `Closed`. Outbound frames wait in a bounded queue that
//! drops its oldest frame when full, so a slow reader sees fresh positions
//! rather than a growing backlog.
//!
//! Concurrency note: all mutable state sits behind one short-held mutex.
//! The transport's writer task is the only consumer of the queue and is woken
//! through a `Notify`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::topic::TopicKey;

/// Opaque connection identifier, stable for the life of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Outcome of handing a frame to a connection. None of these is an error:
/// a frame for a connection that is going away is silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued after dropping the oldest pending frame.
    DisplacedOldest,
    /// The connection is no longer subscribed to the frame's topic.
    NotSubscribed,
    /// The connection is not `Active`.
    Inactive,
}

#[derive(Debug)]
struct Frame {
    topic: Option<TopicKey>,
    message: WsMessage,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    queue: VecDeque<Frame>,
    topics: HashSet<TopicKey>,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    capacity: usize,
    inner: Mutex<Inner>,
    ready: Notify,
    dropped: AtomicU64,
}

impl Connection {
    /// Create a connection in the `Connecting` state with room for
    /// `capacity` outbound frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: ConnectionId::new(),
            capacity,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                queue: VecDeque::with_capacity(capacity),
                topics: HashSet::new(),
            }),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Handshake completed. Only valid from `Connecting`.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Active;
            true
        } else {
            false
        }
    }

    /// Frames dropped by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_subscribed(&self, topic: &TopicKey) -> bool {
        self.inner.lock().topics.contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<TopicKey> {
        self.inner.lock().topics.iter().cloned().collect()
    }

    /// Enqueue a frame that is not tied to a topic (acknowledgements, query
    /// replies).
    pub fn send(&self, message: WsMessage) -> Delivery {
        let mut inner = self.inner.lock();
        self.push(&mut inner, None, message)
    }

    /// Enqueue a topic event, but only while this connection is still
    /// subscribed to `topic`. This check is what keeps a publish that raced
    /// an unsubscribe from reaching the client.
    pub fn publish(&self, topic: &TopicKey, message: WsMessage) -> Delivery {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Active && !inner.topics.contains(topic) {
            return Delivery::NotSubscribed;
        }
        self.push(&mut inner, Some(topic.clone()), message)
    }

    /// Record a subscription and queue its snapshot ahead of any live event.
    /// Returns `false` when the connection is not `Active`.
    pub(crate) fn attach(&self, topic: &TopicKey, snapshot: Option<WsMessage>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Active {
            return false;
        }
        inner.topics.insert(topic.clone());
        if let Some(message) = snapshot {
            self.push(&mut inner, Some(topic.clone()), message);
        }
        true
    }

    /// Forget a subscription and discard any of its frames still queued.
    /// Returns the number of purged frames.
    pub(crate) fn detach(&self, topic: &TopicKey) -> usize {
        let mut inner = self.inner.lock();
        inner.topics.remove(topic);
        let before = inner.queue.len();
        inner.queue.retain(|frame| frame.topic.as_ref() != Some(topic));
        before - inner.queue.len()
    }

    /// Move to `Closing`, discarding queued frames. Returns the topics that
    /// still have to be released from the registry, or `None` when another
    /// caller already started the teardown.
    pub(crate) fn begin_close(&self) -> Option<Vec<TopicKey>> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Closing | ConnectionState::Closed => None,
            ConnectionState::Connecting | ConnectionState::Active => {
                inner.state = ConnectionState::Closing;
                inner.queue.clear();
                let topics = inner.topics.drain().collect();
                drop(inner);
                self.ready.notify_one();
                Some(topics)
            }
        }
    }

    pub(crate) fn finish_close(&self) {
        self.inner.lock().state = ConnectionState::Closed;
        self.ready.notify_one();
    }

    /// Wait for the next outbound frame. Returns `None` once the connection
    /// is closing and nothing is left to flush.
    pub async fn next_frame(&self) -> Option<WsMessage> {
        loop {
            let ready = self.ready.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame.message);
                }
                if matches!(
                    inner.state,
                    ConnectionState::Closing | ConnectionState::Closed
                ) {
                    return None;
                }
            }
            ready.await;
        }
    }

    fn push(&self, inner: &mut Inner, topic: Option<TopicKey>, message: WsMessage) -> Delivery {
        if inner.state != ConnectionState::Active {
            return Delivery::Inactive;
        }

        let mut delivery = Delivery::Queued;
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            delivery = Delivery::DisplacedOldest;
        }
        inner.queue.push_back(Frame { topic, message });
        self.ready.notify_one();
        delivery
    }
}
