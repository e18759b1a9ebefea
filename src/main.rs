//! CLI for Fleetcast
//!
//! Subcommands:
//! - `server`: run the WebSocket server
//! - `watch`: subscribe to a bus or trip and print its events
//! - `report`: send a single position report (useful for smoke tests)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleetcast::cache::LastKnownCache;
use fleetcast::config::load_config;
use fleetcast::transport::{ClientMessage, start_websocket_server};
use fleetcast::utils::logging;
use fleetcast::{Broker, TopicKind};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetcast")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Subscribe to a topic and print every event received
    Watch {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic kind: `bus` or `trip`
        #[arg(long, value_enum, default_value = "bus")]
        kind: Kind,
        /// Bus or trip id
        #[arg(long)]
        id: String,
    },
    /// Report one bus position and print the acknowledgement
    Report {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        bus: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Kind {
    Bus,
    Trip,
}

impl From<Kind> for TopicKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Bus => TopicKind::Bus,
            Kind::Trip => TopicKind::Trip,
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let result = match cmd {
        Command::Server => run_server().await,
        Command::Watch { url, kind, id } => {
            logging::init("info");
            let subscribe = ClientMessage::Subscribe {
                topic_kind: kind.into(),
                id,
            };
            run_client(&url, subscribe, true).await
        }
        Command::Report { url, bus, lat, lon } => {
            logging::init("info");
            let report = ClientMessage::ReportPosition {
                bus_id: bus,
                latitude: lat,
                longitude: lon,
            };
            run_client(&url, report, false).await
        }
    };

    if let Err(e) = result {
        error!("fleetcast failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            return Err(e.into());
        }
    };
    logging::init(&config.server.log_level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Broker::new(&config.broker));

    if config.broker.position_ttl_secs > 0 {
        tokio::spawn(LastKnownCache::start_eviction_loop(
            broker.positions().clone(),
            Duration::from_secs(config.broker.position_ttl_secs),
            Duration::from_secs(config.broker.eviction_interval_secs.max(1)),
        ));
    }

    tokio::select! {
        res = start_websocket_server(addr, broker.clone(), config.broker.clone()) => {
            res?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!(stats = ?broker.stats(), "Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

/// Send `request`, print the replies. With `follow` the client keeps
/// printing events until the server closes the connection.
async fn run_client(
    url: &str,
    request: ClientMessage,
    follow: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;

    ws_stream
        .send(WsMessage::Text(serde_json::to_string(&request)?.into()))
        .await?;

    while let Some(msg) = ws_stream.next().await {
        if let WsMessage::Text(text) = msg? {
            println!("{}", text.as_str());
            if !follow {
                break;
            }
        }
    }

    Ok(())
}
