use serde::Deserialize;

/// Fully resolved configuration: the listener and the broadcast broker.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
}

/// Listener address and default log level.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

/// Broker limits. Bounds memory per connection and fleet-wide, and controls liveness.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// Outbound frames buffered per connection before the oldest is dropped.
    pub queue_capacity: usize,
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// `0` keeps last-known positions for the life of the process.
    pub position_ttl_secs: u64,
    pub eviction_interval_secs: u64,
    /// Bus ids accepted by the ingest handler. Empty accepts any valid token.
    pub known_buses: Vec<String>,
}

/// What the config sources actually provided. `load_config` fills the gaps
/// from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub ping_interval_secs: Option<u64>,
    pub position_ttl_secs: Option<u64>,
    pub eviction_interval_secs: Option<u64>,
    pub known_buses: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                log_level: "info".to_string(),
            },
            broker: BrokerSettings::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            queue_capacity: 64,
            idle_timeout_secs: 60,
            ping_interval_secs: 20,
            position_ttl_secs: 0,
            eviction_interval_secs: 30,
            known_buses: Vec::new(),
        }
    }
}
