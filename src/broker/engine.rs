//! Broker engine
//!
//! The broker wires the connection manager, the topic registry and the
//! last-known-position cache together and exposes the operations the
//! transport calls:
//! - subscription handling (`subscribe` / `unsubscribe`)
//! - report ingestion (`ingest_position` / `ingest_status`)
//! - dispatch (`publish`), run inline on the task that produced the event
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`; every method takes `&self`.
//! - Dispatch never waits on a subscriber: each delivery is a push onto that
//!   connection's bounded queue, which drops its oldest frame when full.
//! - A position report is written to the cache before the topic is locked
//!   for dispatch, and subscribe reads the cache under that same lock, so a
//!   new subscriber either gets the fresh position as its snapshot or
//!   receives it live. A subscribe landing between the cache write and the
//!   dispatch gets both, so the same report can arrive twice; clients treat
//!   `bus-location` as idempotent and deduplicate on `observedAt`.

use std::sync::Arc;

use tracing::{debug, error, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::ingest::ReportValidator;
use crate::broker::message::PositionEvent;
use crate::broker::topic::{Subscribed, TopicKey, TopicKind, TopicRegistry};
use crate::cache::{LastKnownCache, Proximity};
use crate::client::{Connection, ConnectionId, ConnectionManager, Delivery};
use crate::config::BrokerSettings;
use crate::transport::message::ServerMessage;
use crate::utils::Result;

/// Result of `Broker::subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub enum Subscription {
    /// Newly subscribed; `snapshot` is the last known position queued ahead
    /// of live events (bus topics only).
    Joined { snapshot: Option<PositionEvent> },
    AlreadySubscribed,
    /// The connection is gone or closing; nothing changed.
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: usize,
    pub topics: usize,
    pub cached_positions: usize,
    pub dropped_frames: u64,
}

#[derive(Debug)]
pub struct Broker {
    connections: ConnectionManager,
    topics: TopicRegistry,
    positions: Arc<LastKnownCache>,
    validator: ReportValidator,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(&BrokerSettings::default())
    }
}

impl Broker {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            connections: ConnectionManager::new(settings.max_connections, settings.queue_capacity),
            topics: TopicRegistry::new(),
            positions: Arc::new(LastKnownCache::new()),
            validator: ReportValidator::new(settings.known_buses.iter().cloned()),
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn positions(&self) -> &Arc<LastKnownCache> {
        &self.positions
    }

    pub fn accept(&self) -> Result<Arc<Connection>> {
        self.connections.accept()
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections.disconnect(id, &self.topics)
    }

    /// Subscribe a connection to a topic. For bus topics the last known
    /// position, if any, is queued to the subscriber before any live event.
    pub fn subscribe(&self, id: ConnectionId, key: &TopicKey) -> Subscription {
        let Some(connection) = self.connections.get(id) else {
            return Subscription::Inactive;
        };

        let mut snapshot = None;
        let outcome = self.topics.subscribe(key, id, || {
            snapshot = match key.kind() {
                TopicKind::Bus => self.positions.get(key.id()),
                TopicKind::Trip => None,
            };
            let frame = snapshot
                .clone()
                .and_then(|event| encode(&ServerMessage::BusLocation(event)));
            connection.attach(key, frame)
        });

        match outcome {
            Subscribed::Joined => {
                debug!(connection_id = %id, topic = %key, "subscribed");
                Subscription::Joined { snapshot }
            }
            Subscribed::Already => Subscription::AlreadySubscribed,
            Subscribed::Rejected => Subscription::Inactive,
        }
    }

    /// Unsubscribe a connection. Once this returns, no further event of
    /// `key` reaches the connection's queue, and frames of `key` still
    /// waiting in it are discarded. Returns whether a subscription existed.
    pub fn unsubscribe(&self, id: ConnectionId, key: &TopicKey) -> bool {
        let connection = self.connections.get(id);
        let removed = self.topics.unsubscribe(key, id, || {
            if let Some(connection) = &connection {
                connection.detach(key);
            }
        });
        if removed {
            debug!(connection_id = %id, topic = %key, "unsubscribed");
        }
        removed
    }

    /// Validate and fan out a position report on `bus:<busId>`.
    ///
    /// The cache only moves forward in `observed_at`; a late report is still
    /// delivered to live subscribers. Returns the number of subscribers the
    /// event was dispatched to.
    pub fn ingest_position(
        &self,
        bus_id: &str,
        latitude: f64,
        longitude: f64,
        observed_at: i64,
    ) -> Result<usize> {
        let event = self
            .validator
            .position(bus_id, latitude, longitude, observed_at)
            .inspect_err(|e| warn!(bus_id, "rejected position report: {e}"))?;

        if !self.positions.record(&event) {
            debug!(bus_id, observed_at, "late position report left out of cache");
        }

        let key = TopicKey::bus(event.bus_id.clone());
        Ok(self.publish(&key, &ServerMessage::BusLocation(event)))
    }

    /// Validate and fan out a trip status on `trip:<tripId>`.
    pub fn ingest_status(&self, trip_id: &str, status: &str, observed_at: i64) -> Result<usize> {
        let event = self
            .validator
            .status(trip_id, status, observed_at)
            .inspect_err(|e| warn!(trip_id, "rejected status report: {e}"))?;

        let key = TopicKey::trip(event.trip_id.clone());
        Ok(self.publish(&key, &ServerMessage::TripStatus(event)))
    }

    /// Deliver `message` to every current subscriber of `key`. A topic
    /// without subscribers is a no-op. Returns the subscriber count of the
    /// snapshot used.
    pub fn publish(&self, key: &TopicKey, message: &ServerMessage) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };

        self.topics.dispatch(key, |id| {
            let Some(connection) = self.connections.get(id) else {
                return;
            };
            if connection.publish(key, frame.clone()) == Delivery::DisplacedOldest {
                debug!(connection_id = %id, topic = %key, "queue full, dropped oldest frame");
            }
        })
    }

    /// Read-only view of the last known positions for polling clients.
    pub fn last_known_positions(&self, near: Option<&Proximity>) -> Vec<PositionEvent> {
        self.positions.snapshot(near)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.connections.len(),
            topics: self.topics.len(),
            cached_positions: self.positions.len(),
            dropped_frames: self.connections.dropped_total(),
        }
    }
}

fn encode(message: &ServerMessage) -> Option<WsMessage> {
    match message.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to serialize message: {e}");
            None
        }
    }
}
