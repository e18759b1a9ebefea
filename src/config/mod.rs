//! Layered configuration: built-in defaults, then an optional
//! `config/default.{toml,yaml,json}`, then `FLEETCAST__SECTION__KEY`
//! environment variables.

mod settings;

use crate::config::settings::PartialSettings;
use crate::utils::Result;
use config::{Config, Environment, File};

pub use settings::{BrokerSettings, ServerSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// and fills whatever is missing from `Settings::default()`.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("FLEETCAST")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("broker.known_buses")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let server = partial.server;
    let broker = partial.broker;

    Ok(Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            log_level: server
                .as_ref()
                .and_then(|s| s.log_level.clone())
                .unwrap_or(default.server.log_level),
        },
        broker: BrokerSettings {
            max_connections: broker
                .as_ref()
                .and_then(|b| b.max_connections)
                .unwrap_or(default.broker.max_connections),
            queue_capacity: broker
                .as_ref()
                .and_then(|b| b.queue_capacity)
                .unwrap_or(default.broker.queue_capacity),
            idle_timeout_secs: broker
                .as_ref()
                .and_then(|b| b.idle_timeout_secs)
                .unwrap_or(default.broker.idle_timeout_secs),
            ping_interval_secs: broker
                .as_ref()
                .and_then(|b| b.ping_interval_secs)
                .unwrap_or(default.broker.ping_interval_secs),
            position_ttl_secs: broker
                .as_ref()
                .and_then(|b| b.position_ttl_secs)
                .unwrap_or(default.broker.position_ttl_secs),
            eviction_interval_secs: broker
                .as_ref()
                .and_then(|b| b.eviction_interval_secs)
                .unwrap_or(default.broker.eviction_interval_secs),
            known_buses: broker
                .and_then(|b| b.known_buses)
                .unwrap_or(default.broker.known_buses),
        },
    })
}
