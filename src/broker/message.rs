//! Event definitions for the broker
//!
//! Events are immutable facts. Each is published once to its topic and then
//! discarded; only the newest `PositionEvent` per bus survives, in the
//! last-known-position cache.
//!
//! `observed_at` is milliseconds since the UNIX epoch, stamped by the server
//! when the report is received.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::BroadcastError;

/// A bus location, fanned out on `bus:<busId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEvent {
    pub bus_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: i64,
}

/// A trip status change, fanned out on `trip:<tripId>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub trip_id: String,
    pub status: TripStatus,
    pub observed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Delayed,
}

impl TripStatus {
    pub const ALL: [TripStatus; 5] = [
        Self::Scheduled,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
        Self::Delayed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Delayed => "DELAYED",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = BroadcastError;

    /// Exact match against the fixed status set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BroadcastError::InvalidReport(format!("unknown trip status {s:?}")))
    }
}
