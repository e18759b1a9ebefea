//! The `cache` module keeps the last known position of every bus.
//!
//! New subscribers get their snapshot from here, and it backs the polling
//! fallback for clients without a live connection. Nothing is written to
//! disk: the cache lives as long as the process.

pub mod last_known;

pub use last_known::{LastKnownCache, Proximity};

#[cfg(test)]
mod tests;
