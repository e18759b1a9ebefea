//! Errors surfaced by the broadcast subsystem.
//!
//! Only conditions a caller can act on are represented here. Races against a
//! closing connection and unsubscribing from an unknown topic are ordinary
//! outcomes (see `client::Delivery` and `Broker::unsubscribe`), not errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Malformed coordinates, unknown status value or a bad identifier.
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// A subscribe/unsubscribe request naming an unusable topic id.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// A configured resource limit was hit (for example `max_connections`).
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BroadcastError {
    /// Client-facing text for an acknowledgement failure.
    pub fn client_message(&self) -> String {
        match self {
            Self::Io(_) | Self::Config(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BroadcastError>;
