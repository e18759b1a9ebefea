//! # Fleetcast
//!
//! `fleetcast` is the live-position broadcast service of a bus fleet
//! tracker. Buses report their location over a WebSocket; viewers subscribe
//! to a bus (`bus:<busId>`) or a trip (`trip:<tripId>`) and receive every
//! event published to it, starting with the bus's last known position.
//!
//! ## Core Modules
//!
//! - `broker`: topic registry, report validation and event fan-out.
//! - `cache`: last known position per bus, also served to polling clients.
//! - `client`: connection lifecycle and bounded per-connection queues.
//! - `config`: loading server and broker settings.
//! - `transport`: the WebSocket server and its JSON protocol.
//! - `utils`: error type and logging setup.

pub mod broker;
pub mod cache;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::{Broker, TopicKey, TopicKind};
pub use utils::{BroadcastError, Result};
