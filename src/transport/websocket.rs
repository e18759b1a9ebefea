//! WebSocket transport
//!
//! Translates protocol JSON messages into broker operations.
//! Responsibilities:
//! - Accept TCP/WebSocket connections and register them with the `Broker`
//! - Run one reader task per connection that parses requests and acks them
//! - Run one writer task per connection that flushes its outbound queue and
//!   pings the client; a write stalled past the idle timeout ends it
//! - Force-disconnect connections that stay silent past the idle timeout or
//!   whose socket fails, through the broker's regular teardown path

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at};
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, Subscription};
use crate::broker::topic::TopicKey;
use crate::client::{Connection, ConnectionId};
use crate::config::BrokerSettings;
use crate::transport::message::{ClientMessage, RequestKind, ServerMessage};
use crate::utils::{BroadcastError, Result};

/// Bind `addr` and serve until the listener fails.
pub async fn start_websocket_server(
    addr: String,
    broker: Arc<Broker>,
    settings: BrokerSettings,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, broker, settings).await
}

/// Accept connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, settings: BrokerSettings) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TCP connection: {e}");
                continue;
            }
        };
        tokio::spawn(handle_connection(stream, peer, broker.clone(), settings.clone()));
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    settings: BrokerSettings,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let idle = Duration::from_secs(settings.idle_timeout_secs.max(1));

    let connection = match broker.accept() {
        Ok(connection) => connection,
        Err(e) => {
            warn!(%peer, "Rejecting connection: {e}");
            if let Ok(frame) = ServerMessage::failed(RequestKind::Connect, e.client_message()).to_frame() {
                let _ = timeout(idle, ws_sender.send(frame)).await;
            }
            let _ = timeout(idle, ws_sender.close()).await;
            return;
        }
    };
    let client_id = connection.id();
    info!(connection_id = %client_id, %peer, "connection accepted");

    let ping_every = Duration::from_secs(settings.ping_interval_secs.max(1));
    let mut writer = {
        let connection = connection.clone();
        let broker = broker.clone();

        tokio::spawn(async move {
            let exit = write_frames(&connection, &mut ws_sender, ping_every, idle).await;
            broker.disconnect(client_id);
            if exit != WriterExit::Stalled {
                let _ = timeout(idle, ws_sender.close()).await;
            }
            debug!(connection_id = %client_id, ?exit, "send loop closed");
        })
    };

    let mut deadline = Instant::now() + idle;
    let mut writer_done = false;

    loop {
        tokio::select! {
            incoming = timeout_at(deadline, ws_receiver.next()) => {
                let msg = match incoming {
                    Err(_) => {
                        warn!(connection_id = %client_id, "idle timeout, disconnecting");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!(connection_id = %client_id, "read failed: {e}");
                        break;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };
                deadline = Instant::now() + idle;

                match msg {
                    WsMessage::Text(text) => handle_text(&broker, &connection, text.as_str()),
                    WsMessage::Binary(_) => reply(
                        &connection,
                        ServerMessage::failed(RequestKind::Unknown, "binary frames are not supported"),
                    ),
                    WsMessage::Close(_) => break,
                    // Ping/pong only refresh the idle deadline.
                    _ => {}
                }
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    broker.disconnect(client_id);
    if !writer_done && timeout(idle, &mut writer).await.is_err() {
        warn!(connection_id = %client_id, "send loop did not stop, aborting it");
        writer.abort();
    }
    info!(connection_id = %client_id, "disconnected");
}

/// Why a connection's send loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriterExit {
    /// The connection is closing and nothing is left to flush.
    Drained,
    /// The sink returned an error.
    Failed,
    /// One write did not complete within `write_timeout`; the peer stopped
    /// reading.
    Stalled,
}

/// Flush the connection's outbound queue into `sink`, pinging every
/// `ping_every`. A write that takes longer than `write_timeout` counts as a
/// write failure.
pub(crate) async fn write_frames<S>(
    connection: &Connection,
    sink: &mut S,
    ping_every: Duration,
    write_timeout: Duration,
) -> WriterExit
where
    S: Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    let client_id = connection.id();
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let outgoing = tokio::select! {
            frame = connection.next_frame() => match frame {
                Some(frame) => frame,
                None => return WriterExit::Drained,
            },
            _ = ping.tick() => WsMessage::Ping(Default::default()),
        };
        match timeout(write_timeout, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(connection_id = %client_id, "Failed to send message: {e}");
                return WriterExit::Failed;
            }
            Err(_) => {
                warn!(connection_id = %client_id, "write stalled for {write_timeout:?}, disconnecting");
                return WriterExit::Stalled;
            }
        }
    }
}

/// Parse one client frame, apply it to the broker and queue the ack.
pub(crate) fn handle_text(broker: &Broker, connection: &Connection, text: &str) {
    let client_id = connection.id();
    let request = match serde_json::from_str::<ClientMessage>(text) {
        Ok(request) => request,
        Err(err) => {
            warn!(
                connection_id = %client_id,
                "Invalid client message: {err} | {}",
                text.chars().take(100).collect::<String>()
            );
            let err = BroadcastError::from(err);
            reply(connection, ServerMessage::failed(RequestKind::Unknown, err.client_message()));
            return;
        }
    };

    let kind = request.request_kind();
    if let Err(e) = apply(broker, connection, client_id, request) {
        reply(connection, ServerMessage::failed(kind, e.client_message()));
    }
}

/// Executes a request. Successful requests queue their own reply so that a
/// subscribe ack always precedes the snapshot.
fn apply(
    broker: &Broker,
    connection: &Connection,
    client_id: ConnectionId,
    request: ClientMessage,
) -> Result<()> {
    let kind = request.request_kind();
    match request {
        ClientMessage::Subscribe { topic_kind, id } => {
            let key = TopicKey::parse(topic_kind, &id)?;
            // Acked first so the ack precedes the snapshot. `Inactive` means
            // the connection is being torn down, which discards the queued
            // ack along with the rest of its queue.
            reply(connection, ServerMessage::ok(kind));
            if broker.subscribe(client_id, &key) == Subscription::Inactive {
                debug!(connection_id = %client_id, topic = %key, "subscribe on closing connection ignored");
            }
        }
        ClientMessage::Unsubscribe { topic_kind, id } => {
            let key = TopicKey::parse(topic_kind, &id)?;
            broker.unsubscribe(client_id, &key);
            reply(connection, ServerMessage::ok(kind));
        }
        ClientMessage::ReportPosition {
            bus_id,
            latitude,
            longitude,
        } => {
            let observed_at = Utc::now().timestamp_millis();
            broker.ingest_position(&bus_id, latitude, longitude, observed_at)?;
            reply(connection, ServerMessage::ok(kind));
        }
        ClientMessage::ReportStatus { trip_id, status } => {
            let observed_at = Utc::now().timestamp_millis();
            broker.ingest_status(&trip_id, &status, observed_at)?;
            reply(connection, ServerMessage::ok(kind));
        }
        ClientMessage::QueryPositions { near } => {
            if let Some(area) = &near {
                area.validate()?;
            }
            let positions = broker.last_known_positions(near.as_ref());
            reply(connection, ServerMessage::Positions { positions });
        }
    }
    Ok(())
}

fn reply(connection: &Connection, message: ServerMessage) {
    match message.to_frame() {
        Ok(frame) => {
            connection.send(frame);
        }
        Err(e) => warn!(connection_id = %connection.id(), "Failed to serialize reply: {e}"),
    }
}
