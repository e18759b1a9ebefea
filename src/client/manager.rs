//! Connection manager
//!
//! Tracks every live connection by id. `disconnect` is the single teardown
//! path used for explicit closes, read/write failures and idle timeouts: it
//! releases the connection from every topic before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::topic::TopicRegistry;
use crate::client::connection::{Connection, ConnectionId, Delivery};
use crate::utils::{BroadcastError, Result};

#[derive(Debug)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    active: AtomicUsize,
    max_connections: usize,
    queue_capacity: usize,
    /// Drop counts carried over from connections that have since closed.
    retired_drops: AtomicU64,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            active: AtomicUsize::new(0),
            max_connections,
            queue_capacity,
            retired_drops: AtomicU64::new(0),
        }
    }

    /// Register a new connection and make it `Active`.
    ///
    /// Fails with `CapacityExceeded` once `max_connections` are open.
    pub fn accept(&self) -> Result<Arc<Connection>> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .map_err(|n| {
                BroadcastError::CapacityExceeded(format!("{n} connections already open"))
            })?;

        let connection = Arc::new(Connection::new(self.queue_capacity));
        self.connections
            .insert(connection.id(), Arc::clone(&connection));
        connection.activate();

        debug!(connection_id = %connection.id(), "connection registered");
        Ok(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Enqueue a frame for one connection. Unknown or closing connections
    /// are a no-op.
    pub fn send(&self, id: ConnectionId, message: WsMessage) -> Delivery {
        match self.connections.get(&id) {
            Some(connection) => connection.send(message),
            None => Delivery::Inactive,
        }
    }

    /// Tear a connection down: unsubscribe it from every topic, discard its
    /// queue and mark it `Closed`. Idempotent; returns `false` when the
    /// connection was already gone.
    pub fn disconnect(&self, id: ConnectionId, registry: &TopicRegistry) -> bool {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return false;
        };
        self.active.fetch_sub(1, Ordering::AcqRel);

        let topics = connection.begin_close().unwrap_or_default();
        for topic in &topics {
            registry.unsubscribe(topic, id, || {});
        }
        connection.finish_close();

        self.retired_drops
            .fetch_add(connection.dropped(), Ordering::Relaxed);
        info!(
            connection_id = %id,
            topics = topics.len(),
            dropped = connection.dropped(),
            "connection closed"
        );
        true
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Frames dropped by the drop-oldest policy across open and closed
    /// connections.
    pub fn dropped_total(&self) -> u64 {
        let open: u64 = self
            .connections
            .iter()
            .map(|entry| entry.value().dropped())
            .sum();
        open + self.retired_drops.load(Ordering::Relaxed)
    }
}
