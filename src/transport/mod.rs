//! The `transport` module is responsible for network communication with
//! viewers and buses over WebSockets.
//!
//! It defines the JSON protocol spoken with clients and implements the
//! server: connection lifecycle, request parsing and forwarding to the
//! broker.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, RequestKind, ServerMessage};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod websocket_tests;
