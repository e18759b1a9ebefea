//! The `broker` module holds the topic registry and the broker engine that
//! validates reports and fans events out to subscribed connections.

pub mod engine;
pub mod ingest;
pub mod message;
pub mod topic;

pub use engine::{Broker, BrokerStats, Subscription};
pub use topic::{TopicKey, TopicKind};
