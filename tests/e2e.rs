//! End-to-end scenarios
//!
//! Each test binds one or more real nodes on port 0 and drives them with
//! websocket clients, covering the paths a cluster actually exercises:
//! direct delivery, publisher displacement, discovery through a shared
//! directory, the static relay fallback, and admission errors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use hlscdn_rs::auth::AuthConfig;
use hlscdn_rs::client::{HlsPublisher, PublisherConfig, PublisherEvent};
use hlscdn_rs::discovery::PublishRegistry;
use hlscdn_rs::error::Result;
use hlscdn_rs::protocol::ProtocolMessage;
use hlscdn_rs::server::{HlsServer, ServerConfig};

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// In-memory publish registry shared between in-process nodes
#[derive(Default)]
struct MemoryRegistry {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl PublishRegistry for MemoryRegistry {
    async fn get_publishing_server(&self, stream_id: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(stream_id).cloned())
    }

    async fn announce(&self, stream_id: &str, url: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(stream_id.to_string(), url.to_string());
        Ok(())
    }

    fn announce_interval(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Start a node on an ephemeral port
async fn start_node(
    config: ServerConfig,
    registry: Option<Arc<dyn PublishRegistry>>,
) -> (Arc<HlsServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Arc::new(HlsServer::new(config, registry));
    let serving = server.clone();

    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    (server, addr)
}

/// Start a node whose external URL matches its ephemeral address
async fn start_discoverable_node(
    config: ServerConfig,
    registry: Arc<dyn PublishRegistry>,
) -> (Arc<HlsServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = config.external_websocket_url(format!("ws://{}/", addr));
    let server = Arc::new(HlsServer::new(config, Some(registry)));
    let serving = server.clone();

    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    (server, addr)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (socket, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    socket
}

/// Next message, skipping heartbeats and transport-level frames
async fn next_message(socket: &mut WsClient) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection ended unexpectedly")
            .expect("transport error");

        match &message {
            Message::Text(text) if text == "H" => continue,
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return message,
        }
    }
}

/// Next text message, parsed
async fn next_text(socket: &mut WsClient) -> ProtocolMessage {
    match next_message(socket).await {
        Message::Text(text) => ProtocolMessage::parse(&text),
        other => panic!("expected a text message, got {:?}", other),
    }
}

/// Receive one fragment (`F` metadata plus its binary payload)
async fn next_fragment(socket: &mut WsClient) -> (f32, Vec<u8>) {
    let metadata = next_text(socket).await;
    assert_eq!(metadata.message_type, "F");

    let duration: f32 = metadata.parameter("duration").parse().unwrap();

    match next_message(socket).await {
        Message::Binary(data) => (duration, data),
        other => panic!("expected a binary frame after F, got {:?}", other),
    }
}

async fn send_text(socket: &mut WsClient, message: &ProtocolMessage) {
    socket
        .send(Message::Text(message.serialize()))
        .await
        .unwrap();
}

async fn push_fragment(socket: &mut WsClient, duration: f32, data: &[u8]) {
    send_text(socket, &ProtocolMessage::fragment(duration)).await;
    socket.send(Message::Binary(data.to_vec())).await.unwrap();
}

#[tokio::test]
async fn test_direct_publish_and_subscribe() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let mut publisher = connect(addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("test1", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    let mut subscriber = connect(addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("test1", "", false)).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    let fragments: [(f32, &[u8]); 3] = [
        (1.0, &[0xaa, 0xbb, 0xcc, 0x12]),
        (2.5, &[0x11]),
        (2.0, &[0xff, 0x00, 0xff, 0xff]),
    ];

    for (duration, data) in fragments {
        push_fragment(&mut publisher, duration, data).await;
    }

    for (duration, data) in fragments {
        let (received_duration, received_data) = next_fragment(&mut subscriber).await;
        assert_eq!(received_duration, duration);
        assert_eq!(received_data, data);
    }

    send_text(&mut publisher, &ProtocolMessage::close()).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "CLOSE");
}

#[tokio::test]
async fn test_late_joiner_gets_buffered_backlog() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let mut publisher = connect(addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("backlog", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    push_fragment(&mut publisher, 1.0, &[1]).await;
    push_fragment(&mut publisher, 2.0, &[2]).await;
    push_fragment(&mut publisher, 3.0, &[3]).await;

    // Give the node time to drain the publisher's frames into the ring
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut subscriber = connect(addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("backlog", "", false)).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    for expected in [1.0f32, 2.0, 3.0] {
        let (duration, _) = next_fragment(&mut subscriber).await;
        assert_eq!(duration, expected);
    }
}

#[tokio::test]
async fn test_max_initial_fragments_limits_backlog() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let mut publisher = connect(addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("capped", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    for i in 1..=5u8 {
        push_fragment(&mut publisher, i as f32, &[i]).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut subscriber = connect(addr).await;
    let mut pull = ProtocolMessage::pull("capped", "", false);
    pull.parameters
        .insert("max_initial_fragments".to_string(), "2".to_string());
    send_text(&mut subscriber, &pull).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    // Only the first two buffered fragments are replayed
    for expected in [1.0f32, 2.0] {
        let (duration, _) = next_fragment(&mut subscriber).await;
        assert_eq!(duration, expected);
    }

    // Live fragments still flow afterwards
    push_fragment(&mut publisher, 9.0, &[9]).await;
    let (duration, _) = next_fragment(&mut subscriber).await;
    assert_eq!(duration, 9.0);
}

#[tokio::test]
async fn test_pull_miss_answers_ok_then_close() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let mut subscriber = connect(addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("missing", "", false)).await;

    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");
    assert_eq!(next_text(&mut subscriber).await.message_type, "CLOSE");
}

#[tokio::test]
async fn test_push_displacement() {
    let (node, addr) = start_node(ServerConfig::default(), None).await;

    let mut first = connect(addr).await;
    send_text(&mut first, &ProtocolMessage::push("x", "")).await;
    assert_eq!(next_text(&mut first).await.message_type, "OK");

    let mut subscriber = connect(addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("x", "", false)).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    push_fragment(&mut first, 1.0, &[1]).await;
    let (duration, _) = next_fragment(&mut subscriber).await;
    assert_eq!(duration, 1.0);

    // A newer publisher displaces the older source
    let mut second = connect(addr).await;
    send_text(&mut second, &ProtocolMessage::push("x", "")).await;
    assert_eq!(next_text(&mut second).await.message_type, "OK");

    // The displaced source closes; its subscriber is told so
    assert_eq!(next_text(&mut subscriber).await.message_type, "CLOSE");

    // Exactly one (open) source remains registered
    assert_eq!(node.sources().source_count(), 1);
    assert!(!node.sources().get_source("x").unwrap().is_closed());
}

#[tokio::test]
async fn test_push_rejected_without_valid_token() {
    let config = ServerConfig::default().auth(AuthConfig {
        pull_secret: String::new(),
        push_secret: "push-secret".to_string(),
        allow_push: true,
    });

    let (_node, addr) = start_node(config, None).await;

    let mut publisher = connect(addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("test1", "bad-token")).await;

    let error = next_text(&mut publisher).await;
    assert_eq!(error.message_type, "E");
    assert_eq!(error.parameter("code"), "AUTH_ERROR");
}

#[tokio::test]
async fn test_push_rejected_when_push_disallowed() {
    let config = ServerConfig::default().auth(AuthConfig {
        pull_secret: String::new(),
        push_secret: String::new(),
        allow_push: false,
    });

    let (_node, addr) = start_node(config, None).await;

    let mut publisher = connect(addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("test1", "")).await;

    let error = next_text(&mut publisher).await;
    assert_eq!(error.message_type, "E");
    assert_eq!(error.parameter("code"), "AUTH_ERROR");
}

#[tokio::test]
async fn test_fragment_metadata_must_be_positive() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let mut publisher = connect(addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("test1", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    send_text(&mut publisher, &ProtocolMessage::fragment(-1.0)).await;

    let error = next_text(&mut publisher).await;
    assert_eq!(error.message_type, "E");
    assert_eq!(error.parameter("code"), "FRAGMENT_METADATA_ERROR");
}

#[tokio::test]
async fn test_directory_discovery_between_nodes() {
    let registry: Arc<dyn PublishRegistry> = Arc::new(MemoryRegistry::default());

    let (_node_a, addr_a) =
        start_discoverable_node(ServerConfig::default(), registry.clone()).await;
    let (node_b, addr_b) = start_discoverable_node(ServerConfig::default(), registry).await;

    // Publish five fragments on node A
    let mut publisher = connect(addr_a).await;
    send_text(&mut publisher, &ProtocolMessage::push("test2", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    let sizes = [4usize, 8, 3, 10, 8];

    for (i, size) in sizes.iter().enumerate() {
        push_fragment(&mut publisher, i as f32 + 1.0, &vec![i as u8; *size]).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Two subscribers on node B discover the stream through the directory
    let mut subscribers = Vec::new();

    for _ in 0..2 {
        let mut subscriber = connect(addr_b).await;
        send_text(&mut subscriber, &ProtocolMessage::pull("test2", "", false)).await;
        assert_eq!(next_text(&mut subscriber).await.message_type, "OK");
        subscribers.push(subscriber);
    }

    for subscriber in &mut subscribers {
        for (i, size) in sizes.iter().enumerate() {
            let (duration, data) = next_fragment(subscriber).await;
            assert_eq!(duration, i as f32 + 1.0);
            assert_eq!(data.len(), *size);
        }
    }

    // Both subscribers share a single relay session on node B
    assert_eq!(node_b.relays().relay_count(), 1);

    // Closing the publisher propagates through the relay
    send_text(&mut publisher, &ProtocolMessage::close()).await;

    for subscriber in &mut subscribers {
        assert_eq!(next_text(subscriber).await.message_type, "CLOSE");
    }
}

#[tokio::test]
async fn test_three_hop_static_relay() {
    // Publisher node, plus a relay node statically pointed at it
    let (_pub_node, pub_addr) = start_node(ServerConfig::default(), None).await;

    let relay_config = ServerConfig::default().relay_from(format!("ws://{}/", pub_addr));
    let (_relay_node, relay_addr) = start_node(relay_config, None).await;

    let mut publisher = connect(pub_addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("test3", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    push_fragment(&mut publisher, 1.5, &[7, 7, 7]).await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut subscriber = connect(relay_addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("test3", "", false)).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    let (duration, data) = next_fragment(&mut subscriber).await;
    assert_eq!(duration, 1.5);
    assert_eq!(data, vec![7, 7, 7]);

    send_text(&mut publisher, &ProtocolMessage::close()).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "CLOSE");
}

#[tokio::test]
async fn test_only_source_pull_never_relays() {
    let (_pub_node, pub_addr) = start_node(ServerConfig::default(), None).await;

    let relay_config = ServerConfig::default().relay_from(format!("ws://{}/", pub_addr));
    let (relay_node, relay_addr) = start_node(relay_config, None).await;

    let mut publisher = connect(pub_addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("test4", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    // only_source forbids the relay fallback: the pull is an empty stream
    let mut subscriber = connect(relay_addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("test4", "", true)).await;

    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");
    assert_eq!(next_text(&mut subscriber).await.message_type, "CLOSE");
    assert_eq!(relay_node.relays().relay_count(), 0);
}

#[tokio::test]
async fn test_relay_reaped_after_inactivity() {
    let (_pub_node, pub_addr) = start_node(ServerConfig::default(), None).await;

    let mut relay_config = ServerConfig::default().relay_from(format!("ws://{}/", pub_addr));
    relay_config.relay_inactivity_period_seconds = 1;
    let (relay_node, relay_addr) = start_node(relay_config, None).await;

    let mut publisher = connect(pub_addr).await;
    send_text(&mut publisher, &ProtocolMessage::push("reap-me", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    // Open a relay, then walk away
    let mut subscriber = connect(relay_addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("reap-me", "", false)).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");
    assert_eq!(relay_node.relays().relay_count(), 1);

    drop(subscriber);

    // Two inactivity periods plus one tick reap the idle relay
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(relay_node.relays().relay_count(), 0);

    // The next pull dials a fresh relay
    let mut again = connect(relay_addr).await;
    send_text(&mut again, &ProtocolMessage::pull("reap-me", "", false)).await;
    assert_eq!(next_text(&mut again).await.message_type, "OK");
    assert_eq!(relay_node.relays().relay_count(), 1);
}

#[tokio::test]
async fn test_heartbeat_tolerated_in_any_state() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let mut publisher = connect(addr).await;

    // A heartbeat before the opening message is simply ignored
    send_text(&mut publisher, &ProtocolMessage::heartbeat()).await;

    send_text(&mut publisher, &ProtocolMessage::push("hb", "")).await;
    assert_eq!(next_text(&mut publisher).await.message_type, "OK");

    send_text(&mut publisher, &ProtocolMessage::heartbeat()).await;
    push_fragment(&mut publisher, 1.0, &[1]).await;

    let mut subscriber = connect(addr).await;
    send_text(&mut subscriber, &ProtocolMessage::pull("hb", "", false)).await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    let (duration, _) = next_fragment(&mut subscriber).await;
    assert_eq!(duration, 1.0);
}

#[tokio::test]
async fn test_client_publisher_queues_until_ready() {
    let (_node, addr) = start_node(ServerConfig::default(), None).await;

    let config = PublisherConfig::new(format!("ws://{}/", addr), "client-stream");
    let (publisher, mut events) = HlsPublisher::new(config);

    // Queue fragments before the connection is even up
    publisher.send_fragment(1.0, Bytes::from_static(&[1])).await;
    publisher.send_fragment(2.0, Bytes::from_static(&[2, 2])).await;

    // Wait for admission
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for publisher events")
            .expect("event channel ended")
        {
            PublisherEvent::Ready => break,
            PublisherEvent::Error(e) => panic!("publisher error: {}", e),
            _ => {}
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut subscriber = connect(addr).await;
    send_text(
        &mut subscriber,
        &ProtocolMessage::pull("client-stream", "", false),
    )
    .await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "OK");

    for expected in [1.0f32, 2.0] {
        let (duration, _) = next_fragment(&mut subscriber).await;
        assert_eq!(duration, expected);
    }

    // A fragment sent while ready flows straight through
    publisher.send_fragment(3.0, Bytes::from_static(&[3, 3, 3])).await;
    let (duration, data) = next_fragment(&mut subscriber).await;
    assert_eq!(duration, 3.0);
    assert_eq!(data, vec![3, 3, 3]);

    publisher.close().await;
    assert_eq!(next_text(&mut subscriber).await.message_type, "CLOSE");
}

#[tokio::test]
async fn test_banner_on_non_websocket_path() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let config = ServerConfig::default().websocket_prefix("/ws");
    let (_node, addr) = start_node(config, None).await;

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("OK - HLS Websocket CDN"));
}
