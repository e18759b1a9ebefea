//! The `utils` module provides definitions shared across the `fleetcast`
//! crate: the error taxonomy and the tracing setup.

pub mod error;
pub mod logging;

pub use error::{BroadcastError, Result};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }
}
