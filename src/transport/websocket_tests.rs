use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::broker::Broker;
use crate::broker::topic::TopicKind;
use crate::config::BrokerSettings;
use crate::transport::message::{ClientMessage, RequestKind, ServerMessage};
use crate::transport::websocket::serve;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn setup_server(settings: BrokerSettings) -> (SocketAddr, Arc<Broker>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new(&settings));

    tokio::spawn(serve(listener, broker.clone(), settings));
    (addr, broker)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws_stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .expect("WebSocket handshake failed");
    ws_stream
}

async fn send(ws_stream: &mut Client, message: &ClientMessage) {
    ws_stream
        .send(WsMessage::Text(serde_json::to_string(message).unwrap().into()))
        .await
        .expect("Failed to send message");
}

/// Next protocol message, skipping keepalive frames.
async fn receive(ws_stream: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws_stream.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Stream ended")
            .expect("Read failed");
        match frame {
            WsMessage::Text(text) => {
                let text = text.as_str();
                return serde_json::from_str(text).unwrap_or_else(|e| {
                    panic!("Failed to deserialize ServerMessage from '{text}': {e}")
                });
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("Expected text frame, got {other:?}"),
        }
    }
}

/// Waits until the server closes the socket.
async fn expect_closed(ws_stream: &mut Client, within: Duration) {
    tokio::time::timeout(within, async {
        while let Some(frame) = ws_stream.next().await {
            match frame {
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await
    .expect("Server did not close the connection");
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition not reached in time");
}

fn subscribe_bus(id: &str) -> ClientMessage {
    ClientMessage::Subscribe {
        topic_kind: TopicKind::Bus,
        id: id.to_string(),
    }
}

#[tokio::test]
async fn test_live_position_reaches_viewer() {
    let (addr, _broker) = setup_server(BrokerSettings::default()).await;
    let mut viewer = connect(addr).await;
    let mut bus = connect(addr).await;

    send(&mut viewer, &subscribe_bus("7")).await;
    assert_eq!(receive(&mut viewer).await, ServerMessage::ok(RequestKind::Subscribe));

    send(
        &mut bus,
        &ClientMessage::ReportPosition {
            bus_id: "7".to_string(),
            latitude: 36.80,
            longitude: 10.18,
        },
    )
    .await;
    assert_eq!(receive(&mut bus).await, ServerMessage::ok(RequestKind::ReportPosition));

    match receive(&mut viewer).await {
        ServerMessage::BusLocation(event) => {
            assert_eq!(event.bus_id, "7");
            assert_eq!((event.latitude, event.longitude), (36.80, 10.18));
        }
        other => panic!("Expected bus-location, got {other:?}"),
    }
}

#[tokio::test]
async fn test_late_subscriber_gets_snapshot() {
    let (addr, _broker) = setup_server(BrokerSettings::default()).await;
    let mut bus = connect(addr).await;
    send(
        &mut bus,
        &ClientMessage::ReportPosition {
            bus_id: "7".to_string(),
            latitude: 1.0,
            longitude: 2.0,
        },
    )
    .await;
    assert_eq!(receive(&mut bus).await, ServerMessage::ok(RequestKind::ReportPosition));

    let mut viewer = connect(addr).await;
    send(&mut viewer, &subscribe_bus("7")).await;

    assert_eq!(receive(&mut viewer).await, ServerMessage::ok(RequestKind::Subscribe));
    assert!(matches!(
        receive(&mut viewer).await,
        ServerMessage::BusLocation(event) if event.latitude == 1.0
    ));
}

#[tokio::test]
async fn test_trip_status_broadcast() {
    let (addr, _broker) = setup_server(BrokerSettings::default()).await;
    let mut viewer = connect(addr).await;
    let mut bus = connect(addr).await;

    send(
        &mut viewer,
        &ClientMessage::Subscribe {
            topic_kind: TopicKind::Trip,
            id: "t-9".to_string(),
        },
    )
    .await;
    receive(&mut viewer).await;

    send(
        &mut bus,
        &ClientMessage::ReportStatus {
            trip_id: "t-9".to_string(),
            status: "COMPLETED".to_string(),
        },
    )
    .await;
    receive(&mut bus).await;

    match receive(&mut viewer).await {
        ServerMessage::TripStatus(event) => {
            assert_eq!(event.trip_id, "t-9");
            assert_eq!(event.status.as_str(), "COMPLETED");
        }
        other => panic!("Expected trip-status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_message_keeps_connection_open() {
    let (addr, _broker) = setup_server(BrokerSettings::default()).await;
    let mut viewer = connect(addr).await;

    viewer
        .send(WsMessage::Text("{not json".into()))
        .await
        .unwrap();
    assert!(matches!(
        receive(&mut viewer).await,
        ServerMessage::Ack { request: RequestKind::Unknown, ok: false, .. }
    ));

    send(&mut viewer, &ClientMessage::QueryPositions { near: None }).await;
    assert_eq!(
        receive(&mut viewer).await,
        ServerMessage::Positions { positions: vec![] }
    );
}

#[tokio::test]
async fn test_connection_rejected_when_full() {
    let (addr, broker) = setup_server(BrokerSettings {
        max_connections: 1,
        ..BrokerSettings::default()
    })
    .await;
    let mut first = connect(addr).await;
    // Round trip so the first connection is registered.
    send(&mut first, &ClientMessage::QueryPositions { near: None }).await;
    receive(&mut first).await;

    let mut second = connect(addr).await;
    match receive(&mut second).await {
        ServerMessage::Ack {
            request: RequestKind::Connect,
            ok: false,
            error: Some(error),
        } => assert!(error.starts_with("capacity exceeded")),
        other => panic!("Expected connect rejection, got {other:?}"),
    }
    expect_closed(&mut second, Duration::from_secs(2)).await;
    assert_eq!(broker.stats().connections, 1);
}

#[tokio::test]
async fn test_close_releases_subscriptions() {
    let (addr, broker) = setup_server(BrokerSettings::default()).await;
    let mut viewer = connect(addr).await;
    send(&mut viewer, &subscribe_bus("7")).await;
    receive(&mut viewer).await;
    eventually(|| broker.stats().topics == 1).await;

    viewer.close(None).await.unwrap();

    eventually(|| broker.topics().is_empty() && broker.connections().is_empty()).await;
    assert_eq!(broker.ingest_position("7", 0.0, 0.0, 1).unwrap(), 0);
}

#[tokio::test]
async fn test_idle_connection_is_dropped() {
    let (addr, broker) = setup_server(BrokerSettings {
        idle_timeout_secs: 1,
        ..BrokerSettings::default()
    })
    .await;
    let mut viewer = connect(addr).await;
    send(&mut viewer, &subscribe_bus("7")).await;
    receive(&mut viewer).await;

    expect_closed(&mut viewer, Duration::from_secs(5)).await;
    eventually(|| broker.connections().is_empty()).await;
    assert!(broker.topics().is_empty());
}

#[tokio::test]
async fn test_server_sends_keepalive_pings() {
    let (addr, _broker) = setup_server(BrokerSettings {
        ping_interval_secs: 1,
        ..BrokerSettings::default()
    })
    .await;
    let mut viewer = connect(addr).await;

    let frame = tokio::time::timeout(Duration::from_secs(3), viewer.next())
        .await
        .expect("No keepalive received")
        .unwrap()
        .unwrap();
    assert!(matches!(frame, WsMessage::Ping(_)));
}

fn active_connection() -> crate::client::Connection {
    let connection = crate::client::Connection::new(8);
    assert!(connection.activate());
    connection
}

#[tokio::test]
async fn test_send_loop_gives_up_on_stalled_peer() {
    use crate::transport::websocket::{WriterExit, write_frames};

    let connection = active_connection();
    connection.send(WsMessage::text("{}"));
    // A peer that never drains its socket: every write stays pending.
    let mut sink = Box::pin(futures_util::sink::unfold((), |(), _frame: WsMessage| {
        futures_util::future::pending::<std::result::Result<(), std::io::Error>>()
    }));

    let exit = tokio::time::timeout(
        Duration::from_secs(2),
        write_frames(&connection, &mut sink, Duration::from_secs(60), Duration::from_millis(50)),
    )
    .await
    .expect("send loop hung on a stalled write");
    assert_eq!(exit, WriterExit::Stalled);
}

#[tokio::test]
async fn test_send_loop_stops_on_write_error() {
    use crate::transport::websocket::{WriterExit, write_frames};

    let connection = active_connection();
    connection.send(WsMessage::text("{}"));
    let mut sink = Box::pin(futures_util::sink::unfold((), |(), _frame: WsMessage| async {
        Err::<(), _>(std::io::Error::other("connection reset"))
    }));

    let exit = write_frames(&connection, &mut sink, Duration::from_secs(60), Duration::from_secs(1)).await;
    assert_eq!(exit, WriterExit::Failed);
}

#[tokio::test]
async fn test_send_loop_flushes_until_close() {
    use crate::transport::websocket::{WriterExit, write_frames};

    let connection = active_connection();
    connection.send(WsMessage::text("1"));
    connection.send(WsMessage::text("2"));
    let mut written: Vec<WsMessage> = Vec::new();

    let (exit, _) = tokio::join!(
        write_frames(&connection, &mut written, Duration::from_secs(60), Duration::from_secs(1)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            connection.begin_close();
            connection.finish_close();
        }
    );

    assert_eq!(exit, WriterExit::Drained);
    assert_eq!(written, vec![WsMessage::text("1"), WsMessage::text("2")]);
}
