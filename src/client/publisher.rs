//! Stream publisher
//!
//! Owns one connection attempt at a time: dial, authenticate with a signed
//! push token, read until the connection drops, wait the retry delay, and
//! dial again until closed. Fragments sent while disconnected (or before
//! the server's `OK`) land in a bounded queue that drains, in order, once
//! the client is ready.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::config::PublisherConfig;
use crate::auth::{sign_auth_token, ACTION_PUSH};
use crate::protocol::{
    ProtocolMessage, HEARTBEAT_PERIOD, MSG_TYPE_ERROR, MSG_TYPE_OK,
};

/// Events from the publisher
#[derive(Debug)]
pub enum PublisherEvent {
    /// Connected to the server, not yet admitted
    Connected,

    /// The server accepted the stream; queued fragments were flushed
    Ready,

    /// Error occurred (dial, auth, or transport)
    Error(String),

    /// Disconnected; the client will retry unless closed
    Disconnected,
}

type OutboundSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

struct PublisherState {
    closed: bool,
    ready: bool,
    sink: Option<OutboundSink>,
    pending_queue: VecDeque<(f32, Bytes)>,
}

struct PublisherInner {
    config: PublisherConfig,
    state: tokio::sync::Mutex<PublisherState>,
    closed_tx: watch::Sender<bool>,
    event_tx: mpsc::Sender<PublisherEvent>,
}

/// HLS stream publisher
///
/// # Example
/// ```no_run
/// use bytes::Bytes;
/// use hlscdn_rs::client::{HlsPublisher, PublisherConfig};
///
/// # async fn example() {
/// let config = PublisherConfig::new("ws://localhost:8080/", "my-stream");
/// let (publisher, mut events) = HlsPublisher::new(config);
///
/// tokio::spawn(async move {
///     while let Some(event) = events.recv().await {
///         println!("Event: {:?}", event);
///     }
/// });
///
/// publisher
///     .send_fragment(2.0, Bytes::from_static(b"fragment data"))
///     .await;
/// # }
/// ```
pub struct HlsPublisher {
    inner: Arc<PublisherInner>,
}

impl HlsPublisher {
    /// Create a publisher and start its connection loop
    ///
    /// Returns the publisher and a receiver for its events.
    pub fn new(config: PublisherConfig) -> (Self, mpsc::Receiver<PublisherEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(PublisherInner {
            config,
            state: tokio::sync::Mutex::new(PublisherState {
                closed: false,
                ready: false,
                sink: None,
                pending_queue: VecDeque::new(),
            }),
            closed_tx,
            event_tx,
        });

        tokio::spawn(run(inner.clone()));
        tokio::spawn(send_heartbeats(inner.clone()));

        (Self { inner }, event_rx)
    }

    /// Whether `close` has been called
    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Whether the server has admitted the stream
    pub async fn is_ready(&self) -> bool {
        self.inner.state.lock().await.ready
    }

    /// Send one fragment
    ///
    /// Written directly when ready; queued otherwise, evicting the oldest
    /// queued fragment when the queue is full. Empty fragments are ignored.
    pub async fn send_fragment(&self, duration: f32, data: Bytes) {
        if data.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock().await;

        if state.closed {
            return;
        }

        if state.ready {
            if let Some(sink) = state.sink.as_mut() {
                let _ = send_fragment_frames(sink, duration, &data).await;
            }
        } else {
            if state.pending_queue.len() >= self.inner.config.queue_max_length.max(1) {
                state.pending_queue.pop_front();
            }

            state.pending_queue.push_back((duration, data));
        }
    }

    /// Finish publishing: send `CLOSE`, drop the connection, stop retrying
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;

        if state.closed {
            return;
        }

        if let Some(mut sink) = state.sink.take() {
            let _ = sink
                .send(Message::Text(ProtocolMessage::close().serialize()))
                .await;
            let _ = sink.send(Message::Close(None)).await;
        }

        state.pending_queue.clear();
        state.closed = true;
        state.ready = false;

        drop(state);

        self.inner.closed_tx.send_replace(true);
    }
}

async fn send_fragment_frames(
    sink: &mut OutboundSink,
    duration: f32,
    data: &Bytes,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
    sink.send(Message::Text(
        ProtocolMessage::fragment(duration).serialize(),
    ))
    .await?;
    sink.send(Message::Binary(data.to_vec())).await
}

impl PublisherInner {
    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    async fn emit(&self, event: PublisherEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Store the new connection's write half
    async fn on_connected(&self, sink: OutboundSink) {
        let mut state = self.state.lock().await;

        if state.closed {
            return;
        }

        state.sink = Some(sink);
    }

    /// Flush the pending queue once the server admits the stream
    async fn on_ready(&self) {
        let mut state = self.state.lock().await;

        if state.closed {
            return;
        }

        state.ready = true;

        while let Some((duration, data)) = state.pending_queue.pop_front() {
            if let Some(sink) = state.sink.as_mut() {
                let _ = send_fragment_frames(sink, duration, &data).await;
            }
        }

        drop(state);

        self.emit(PublisherEvent::Ready).await;
    }

    async fn on_disconnected(&self) {
        let mut state = self.state.lock().await;

        if state.closed {
            return;
        }

        state.ready = false;
        state.sink = None;

        drop(state);

        self.emit(PublisherEvent::Disconnected).await;
    }
}

/// Connection loop: dial, authenticate, read until the connection ends
async fn run(inner: Arc<PublisherInner>) {
    let retry_delay = inner.config.connection_retry_delay;

    while !inner.is_closed().await {
        let (socket, _) = match connect_async(inner.config.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                inner.emit(PublisherEvent::Error(e.to_string())).await;
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };

        if inner.is_closed().await {
            return;
        }

        let (mut sink, mut stream) = socket.split();

        // Authenticate
        let token = match sign_auth_token(
            &inner.config.auth_secret,
            ACTION_PUSH,
            &inner.config.stream_id,
        ) {
            Ok(token) => token,
            Err(e) => {
                inner.emit(PublisherEvent::Error(e.to_string())).await;
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };

        let push = ProtocolMessage::push(&inner.config.stream_id, &token);

        if let Err(e) = sink.send(Message::Text(push.serialize())).await {
            inner.emit(PublisherEvent::Error(e.to_string())).await;
            tokio::time::sleep(retry_delay).await;
            continue;
        }

        inner.on_connected(sink).await;
        inner.emit(PublisherEvent::Connected).await;

        let mut closed_with_error = false;
        let mut closed_watch = inner.closed_tx.subscribe();

        loop {
            let message = tokio::select! {
                _ = closed_watch.changed() => break,
                received = tokio::time::timeout(HEARTBEAT_PERIOD * 2, stream.next()) => {
                    match received {
                        Err(_) => {
                            closed_with_error = true;
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            if !inner.is_closed().await {
                                inner.emit(PublisherEvent::Error(e.to_string())).await;
                                closed_with_error = true;
                            }
                            break;
                        }
                        Ok(Some(Ok(message))) => message,
                    }
                }
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let parsed = ProtocolMessage::parse(&text);

            match parsed.message_type.as_str() {
                MSG_TYPE_ERROR => {
                    inner
                        .emit(PublisherEvent::Error(format!(
                            "Error from CDN. Code: {}, Message: {}",
                            parsed.parameter("code"),
                            parsed.parameter("message")
                        )))
                        .await;
                    closed_with_error = true;
                }
                MSG_TYPE_OK => {
                    inner.on_ready().await;
                }
                _ => {}
            }
        }

        inner.on_disconnected().await;

        if closed_with_error {
            tokio::time::sleep(retry_delay).await;
        }
    }
}

/// Send heartbeats periodically until the publisher closes
async fn send_heartbeats(inner: Arc<PublisherInner>) {
    let mut closed_watch = inner.closed_tx.subscribe();

    loop {
        tokio::select! {
            _ = closed_watch.changed() => return,
            _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {
                let mut state = inner.state.lock().await;

                if state.closed {
                    return;
                }

                if let Some(sink) = state.sink.as_mut() {
                    let heartbeat = ProtocolMessage::heartbeat().serialize();
                    let _ = sink.send(Message::Text(heartbeat)).await;
                }
            }
        }
    }
}
