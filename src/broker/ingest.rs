//! Report validation
//!
//! Turns raw position/status reports into events. A rejected report never
//! reaches the cache or the dispatcher.

use std::collections::HashSet;

use crate::broker::message::{PositionEvent, StatusEvent, TripStatus};
use crate::utils::{BroadcastError, Result};

pub const MAX_ID_LEN: usize = 64;

/// Identifiers are non-empty tokens of at most `MAX_ID_LEN` characters from
/// `[A-Za-z0-9_.-]`. `what` names the identifier in the error text.
pub fn validate_id(what: &str, id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err(format!("{what} id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!("{what} id longer than {MAX_ID_LEN} characters"));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!("{what} id contains invalid character {c:?}"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ReportValidator {
    known_buses: HashSet<String>,
}

impl ReportValidator {
    /// `known_buses` restricts which buses may report; empty accepts any
    /// well-formed id.
    pub fn new<I>(known_buses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            known_buses: known_buses.into_iter().collect(),
        }
    }

    pub fn position(
        &self,
        bus_id: &str,
        latitude: f64,
        longitude: f64,
        observed_at: i64,
    ) -> Result<PositionEvent> {
        validate_id("bus", bus_id).map_err(BroadcastError::InvalidReport)?;
        if !self.known_buses.is_empty() && !self.known_buses.contains(bus_id) {
            return Err(BroadcastError::InvalidReport(format!(
                "bus {bus_id} is not part of the fleet"
            )));
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(BroadcastError::InvalidReport(format!(
                "latitude {latitude} outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(BroadcastError::InvalidReport(format!(
                "longitude {longitude} outside [-180, 180]"
            )));
        }

        Ok(PositionEvent {
            bus_id: bus_id.to_string(),
            latitude,
            longitude,
            observed_at,
        })
    }

    pub fn status(&self, trip_id: &str, status: &str, observed_at: i64) -> Result<StatusEvent> {
        validate_id("trip", trip_id).map_err(BroadcastError::InvalidReport)?;
        let status: TripStatus = status.parse()?;

        Ok(StatusEvent {
            trip_id: trip_id.to_string(),
            status,
            observed_at,
        })
    }
}
