//! Topic management
//!
//! A topic is either `bus:<busId>` or `trip:<tripId>` and holds the ids of
//! the connections subscribed to it. Topics are created on first subscribe
//! and removed as soon as their subscriber set becomes empty.
//!
//! Each topic slot carries two locks:
//! - `state` guards the subscriber set; it is held only for O(1) updates and
//!   to take a snapshot.
//! - `gate` orders dispatches. A publisher takes the gate first, copies the
//!   subscriber set under a brief `state` lock and fans out on that copy
//!   while holding only the gate, so every subscriber sees a topic's events
//!   in the order they were accepted. Subscribe and unsubscribe never wait
//!   for a fan-out.
//!
//! A slot removed from the map is marked `retired`; a subscriber that raced
//! the removal and locked the dead slot retries against a fresh one.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::broker::ingest::validate_id;
use crate::client::ConnectionId;
use crate::utils::{BroadcastError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Bus,
    Trip,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus => f.write_str("bus"),
            Self::Trip => f.write_str("trip"),
        }
    }
}

/// Stable key of a broadcast topic, rendered as `bus:<id>` or `trip:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    kind: TopicKind,
    id: String,
}

impl TopicKey {
    pub fn bus(id: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Bus,
            id: id.into(),
        }
    }

    pub fn trip(id: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Trip,
            id: id.into(),
        }
    }

    /// Build a key from client input, rejecting ids that are not valid tokens.
    pub fn parse(kind: TopicKind, id: &str) -> Result<Self> {
        validate_id(&kind.to_string(), id).map_err(BroadcastError::InvalidTopic)?;
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscribers: HashSet<ConnectionId>,
    retired: bool,
}

#[derive(Debug, Default)]
struct TopicSlot {
    state: Mutex<TopicState>,
    gate: Mutex<()>,
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: DashMap<TopicKey, Arc<TopicSlot>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `key`, creating the topic if absent.
    ///
    /// `join` runs under the topic lock before the id becomes visible to
    /// publishers; it records the subscription on the connection and queues
    /// the snapshot. Returning `false` from it (connection no longer active)
    /// leaves the registry untouched. Subscribing twice does not run `join`
    /// again.
    pub fn subscribe<F>(&self, key: &TopicKey, id: ConnectionId, join: F) -> Subscribed
    where
        F: FnOnce() -> bool,
    {
        let mut join = Some(join);
        loop {
            let slot = Arc::clone(self.topics.entry(key.clone()).or_default().value());
            let mut state = slot.state.lock();
            if state.retired {
                continue;
            }
            if state.subscribers.contains(&id) {
                return Subscribed::Already;
            }

            if join.take().is_some_and(|join| join()) {
                state.subscribers.insert(id);
                return Subscribed::Joined;
            }
            if state.subscribers.is_empty() {
                self.retire(key, &slot, &mut state);
            }
            return Subscribed::Rejected;
        }
    }

    /// Remove `id` from `key`, dropping the topic when it becomes empty.
    /// `leave` runs under the topic lock when the id was present. Unknown
    /// topics and ids are a no-op; returns whether anything was removed.
    pub fn unsubscribe<F>(&self, key: &TopicKey, id: ConnectionId, leave: F) -> bool
    where
        F: FnOnce(),
    {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut state = slot.state.lock();
        let removed = state.subscribers.remove(&id);
        if removed {
            leave();
        }
        if state.subscribers.is_empty() && !state.retired {
            self.retire(key, &slot, &mut state);
        }
        removed
    }

    /// Point-in-time copy of the subscribers of `key`.
    pub fn subscribers_of(&self, key: &TopicKey) -> Vec<ConnectionId> {
        self.slot(key)
            .map(|slot| slot.state.lock().subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fan out to the current subscribers of `key`, calling `deliver` once
    /// per subscriber on a snapshot. Dispatches to the same topic never
    /// interleave. Returns the number of subscribers in the snapshot.
    pub fn dispatch<F>(&self, key: &TopicKey, mut deliver: F) -> usize
    where
        F: FnMut(ConnectionId),
    {
        let Some(slot) = self.slot(key) else {
            return 0;
        };
        let _order = slot.gate.lock();
        let subscribers: Vec<ConnectionId> =
            slot.state.lock().subscribers.iter().copied().collect();

        for id in &subscribers {
            deliver(*id);
        }
        subscribers.len()
    }

    pub fn contains(&self, key: &TopicKey) -> bool {
        self.topics.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    fn slot(&self, key: &TopicKey) -> Option<Arc<TopicSlot>> {
        self.topics.get(key).map(|slot| Arc::clone(slot.value()))
    }

    fn retire(&self, key: &TopicKey, slot: &Arc<TopicSlot>, state: &mut TopicState) {
        state.retired = true;
        self.topics
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }
}

/// Registry-level result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscribed {
    Joined,
    Already,
    /// The connection was not active; nothing was recorded.
    Rejected,
}
