//! Last-known-position cache
//!
//! One entry per bus, always the report with the highest `observed_at`
//! accepted so far. Late reports (network retries) still go out to live
//! subscribers but never regress the cached value.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::message::PositionEvent;
use crate::utils::{BroadcastError, Result};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone)]
struct CachedPosition {
    event: PositionEvent,
    /// Server clock (ms) of the last accepted update, used for TTL eviction.
    recorded_at: i64,
}

#[derive(Debug, Default)]
pub struct LastKnownCache {
    entries: DashMap<String, CachedPosition>,
}

impl LastKnownCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `event` unless the cache already holds a newer report for the
    /// same bus. Returns whether the cache changed.
    pub fn record(&self, event: &PositionEvent) -> bool {
        let recorded_at = Utc::now().timestamp_millis();
        match self.entries.entry(event.bus_id.clone()) {
            Entry::Occupied(mut current) => {
                if event.observed_at < current.get().event.observed_at {
                    return false;
                }
                current.insert(CachedPosition {
                    event: event.clone(),
                    recorded_at,
                });
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(CachedPosition {
                    event: event.clone(),
                    recorded_at,
                });
                true
            }
        }
    }

    pub fn get(&self, bus_id: &str) -> Option<PositionEvent> {
        self.entries.get(bus_id).map(|entry| entry.event.clone())
    }

    /// All cached positions ordered by bus id, optionally restricted to
    /// those within `near`.
    pub fn snapshot(&self, near: Option<&Proximity>) -> Vec<PositionEvent> {
        let mut positions: Vec<PositionEvent> = self
            .entries
            .iter()
            .map(|entry| entry.event.clone())
            .filter(|event| near.is_none_or(|area| area.contains(event.latitude, event.longitude)))
            .collect();
        positions.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
        positions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry last updated more than `ttl` before `now_ms`.
    /// Returns the number of evicted buses.
    pub fn evict_stale(&self, now_ms: i64, ttl: Duration) -> usize {
        let cutoff = now_ms - i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.recorded_at >= cutoff);
        before.saturating_sub(self.entries.len())
    }

    /// Periodically evict buses that stopped reporting. Intended to be
    /// spawned as a background task; runs until the runtime shuts down.
    pub async fn start_eviction_loop(cache: Arc<LastKnownCache>, ttl: Duration, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = cache.evict_stale(Utc::now().timestamp_millis(), ttl);
            if evicted > 0 {
                debug!(evicted, remaining = cache.len(), "evicted stale positions");
            }
        }
    }
}

/// Circular area used to filter polling results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proximity {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
}

impl Proximity {
    pub fn validate(&self) -> Result<()> {
        let valid = (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.radius_km.is_finite()
            && self.radius_km >= 0.0;
        if valid {
            Ok(())
        } else {
            Err(BroadcastError::InvalidReport(format!(
                "invalid proximity filter {self:?}"
            )))
        }
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        haversine_km(self.latitude, self.longitude, latitude, longitude) <= self.radius_km
    }
}

/// Great-circle distance between two coordinates, in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}
