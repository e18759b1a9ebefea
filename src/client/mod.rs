//! The `client` module is the connection manager of the broadcast subsystem.
//!
//! A `Connection` is one live duplex channel to a viewer or a bus: it owns a
//! bounded outbound queue, its lifecycle state and the set of topics it is
//! subscribed to. The `ConnectionManager` hands connections out on accept and
//! tears them down on disconnect; everything else refers to a connection by
//! its `ConnectionId`.

pub mod connection;
pub mod manager;

pub use connection::{Connection, ConnectionId, ConnectionState, Delivery};
pub use manager::ConnectionManager;
