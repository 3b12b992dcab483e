//! Outbound relay

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::Authenticator;
use crate::limits::MemoryLimiter;
use crate::protocol::{
    ProtocolMessage, ERR_FRAGMENT_METADATA, ERR_PROTOCOL, HEARTBEAT_PERIOD, MSG_TYPE_CLOSE,
    MSG_TYPE_ERROR, MSG_TYPE_FRAGMENT, MSG_TYPE_OK,
};
use crate::source::{Fragment, SourceEvent};

struct RelayState {
    /// Attached listeners, keyed by connection ID
    listeners: HashMap<u64, mpsc::Sender<SourceEvent>>,

    /// Ring of recent fragments
    fragment_buffer: VecDeque<Arc<Fragment>>,

    /// True once closed
    closed: bool,

    /// First-strike flag for the inactivity probe
    inactivity_warning: bool,
}

/// A local mirror of a stream published on another node
///
/// Externally identical to a [`crate::source::Source`]; internally it is a
/// subscriber session on an upstream node.
pub struct Relay {
    id: u64,
    url: String,
    stream_id: String,
    only_source: bool,
    capacity: usize,
    max_binary_message_size: usize,
    inactivity_period: Duration,
    auth: Arc<Authenticator>,
    memory_limiter: Arc<MemoryLimiter>,
    state: Mutex<RelayState>,
    ready_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl Relay {
    /// Create a new relay; `run` must be spawned for it to do anything
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        url: impl Into<String>,
        stream_id: impl Into<String>,
        only_source: bool,
        capacity: usize,
        max_binary_message_size: usize,
        inactivity_period: Duration,
        auth: Arc<Authenticator>,
        memory_limiter: Arc<MemoryLimiter>,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        Self {
            id,
            url: url.into(),
            stream_id: stream_id.into(),
            only_source,
            capacity: capacity.max(1),
            max_binary_message_size,
            inactivity_period: inactivity_period.max(Duration::from_secs(1)),
            auth,
            memory_limiter,
            state: Mutex::new(RelayState {
                listeners: HashMap::new(),
                fragment_buffer: VecDeque::new(),
                closed: false,
                inactivity_warning: false,
            }),
            ready_tx,
            closed_tx,
        }
    }

    /// Relay ID, unique per node
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream ID this relay mirrors
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether the relay has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Blocks until the upstream answered `OK` or the relay failed
    ///
    /// Guarantees that a subscriber attached right after this returns will
    /// observe either buffered fragments or a prompt close, never an
    /// indefinite silent wait.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready_tx.subscribe();

        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    /// Attach a listener; same contract as [`crate::source::Source::add_listener`]
    pub fn add_listener(
        &self,
        connection_id: u64,
    ) -> Option<(mpsc::Receiver<SourceEvent>, Vec<Arc<Fragment>>)> {
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut state = self.state.lock().unwrap();

        if state.closed {
            return None;
        }

        state.listeners.insert(connection_id, tx);

        let snapshot = state.fragment_buffer.iter().cloned().collect();

        Some((rx, snapshot))
    }

    /// Detach a listener; idempotent
    pub fn remove_listener(&self, connection_id: u64) {
        self.state.lock().unwrap().listeners.remove(&connection_id);
    }

    /// Number of attached listeners
    pub fn listener_count(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }

    /// Append a relayed fragment and fan it out; mirrors the source path
    pub fn add_fragment(&self, fragment: Arc<Fragment>) {
        let mut state = self.state.lock().unwrap();

        if state.closed {
            return;
        }

        if !self
            .memory_limiter
            .check_before_adding(&mut state.fragment_buffer, &fragment)
        {
            return;
        }

        if state.fragment_buffer.len() >= self.capacity {
            if let Some(removed) = state.fragment_buffer.pop_front() {
                self.memory_limiter.on_fragment_release(&removed);
            }
        }

        state.fragment_buffer.push_back(fragment.clone());

        tracing::debug!(
            relay_id = self.id,
            stream = %self.stream_id,
            duration = fragment.duration,
            size = fragment.len(),
            "Fragment relayed"
        );

        for listener in state.listeners.values() {
            let _ = listener.try_send(SourceEvent::Fragment(fragment.clone()));
        }
    }

    /// Close the relay; idempotent
    ///
    /// Broadcasts `Close` downstream, releases the ring from the memory
    /// budget, and signals the run loop and its housekeeping tasks to stop.
    pub fn close(&self) {
        let buffer = {
            let mut state = self.state.lock().unwrap();

            if state.closed {
                return;
            }

            tracing::debug!(relay_id = self.id, stream = %self.stream_id, "Relay closed");

            for listener in state.listeners.values() {
                let _ = listener.try_send(SourceEvent::Close);
            }

            state.listeners.clear();
            state.closed = true;

            std::mem::take(&mut state.fragment_buffer)
        };

        self.memory_limiter.on_buffer_release(&buffer);

        self.closed_tx.send_replace(true);
    }

    /// One inactivity check; returns true when the relay closed itself
    ///
    /// Two strikes: the first empty check sets a warning, the second closes.
    fn check_inactivity(&self) -> bool {
        let should_close = {
            let mut state = self.state.lock().unwrap();

            if state.closed {
                return true;
            }

            if !state.listeners.is_empty() {
                state.inactivity_warning = false;
                false
            } else if state.inactivity_warning {
                true
            } else {
                tracing::debug!(relay_id = self.id, stream = %self.stream_id, "Inactivity detected");
                state.inactivity_warning = true;
                false
            }
        };

        if should_close {
            tracing::info!(
                relay_id = self.id,
                stream = %self.stream_id,
                "Closing the relay due to inactivity"
            );
            self.close();
        }

        should_close
    }

    /// Run the relay connection until it ends
    ///
    /// Dials the upstream, authenticates with a fresh pull token, then
    /// mirrors incoming fragments until an error, a read deadline, a
    /// `CLOSE`, or the inactivity probe stops it. Always marks the relay
    /// ready and closed on the way out so waiters are released exactly once.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            relay_id = self.id,
            url = %self.url,
            stream = %self.stream_id,
            "Relay created"
        );

        self.run_connection().await;

        self.set_ready();
        self.close();

        tracing::info!(relay_id = self.id, stream = %self.stream_id, "Relay connection closed");
    }

    async fn run_connection(self: &Arc<Self>) {
        let socket_config = WebSocketConfig {
            max_message_size: Some(self.max_binary_message_size),
            max_frame_size: Some(self.max_binary_message_size),
            ..Default::default()
        };

        let (socket, _) = match connect_async_with_config(self.url.as_str(), Some(socket_config), false)
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                tracing::error!(relay_id = self.id, error = %e, "Could not connect to the server");
                return;
            }
        };

        if self.is_closed() {
            return;
        }

        tracing::info!(relay_id = self.id, "Connected to the server");

        let (sink, mut stream) = socket.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        // Authenticate
        let pull = ProtocolMessage::pull(
            &self.stream_id,
            &self.auth.create_pull_token(&self.stream_id),
            self.only_source,
        );

        if let Err(e) = sink.lock().await.send(Message::Text(pull.serialize())).await {
            tracing::error!(relay_id = self.id, error = %e, "Could not authenticate");
            return;
        }

        let heartbeat_handle = self.spawn_heartbeat_task(sink.clone());
        let inactivity_handle = self.spawn_inactivity_task();

        let mut closed = self.closed_tx.subscribe();
        let mut staged_duration: Option<f32> = None;

        loop {
            let message = tokio::select! {
                _ = closed.changed() => break,
                received = tokio::time::timeout(HEARTBEAT_PERIOD * 2, stream.next()) => {
                    match received {
                        Err(_) => break, // read deadline
                        Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            if !self.is_closed() {
                                tracing::error!(relay_id = self.id, error = %e, "Could not read message");
                            }
                            break;
                        }
                        Ok(Some(Ok(message))) => message,
                    }
                }
            };

            match message {
                Message::Text(text) => {
                    if staged_duration.is_some() {
                        self.send_error(&sink, ERR_PROTOCOL, "Expected a binary message")
                            .await;
                        break;
                    }

                    if !self.handle_text_message(&sink, &text, &mut staged_duration).await {
                        break;
                    }
                }
                Message::Binary(data) => {
                    let duration = match staged_duration.take() {
                        Some(duration) => duration,
                        None => {
                            self.send_error(&sink, ERR_PROTOCOL, "Unexpected binary message")
                                .await;
                            break;
                        }
                    };

                    if data.is_empty() {
                        self.send_error(&sink, ERR_PROTOCOL, "Unexpected empty binary message")
                            .await;
                        break;
                    }

                    self.add_fragment(Arc::new(Fragment::new(duration, data.into())));
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }

            if self.is_closed() {
                break;
            }
        }

        heartbeat_handle.abort();
        inactivity_handle.abort();
    }

    /// Handle one upstream text message; false ends the connection
    async fn handle_text_message(
        &self,
        sink: &Arc<tokio::sync::Mutex<SplitSinkHalf>>,
        text: &str,
        staged_duration: &mut Option<f32>,
    ) -> bool {
        let message = ProtocolMessage::parse(text);

        match message.message_type.as_str() {
            MSG_TYPE_ERROR => {
                tracing::debug!(
                    relay_id = self.id,
                    code = message.parameter("code"),
                    message = message.parameter("message"),
                    "Error from server"
                );
                false
            }
            MSG_TYPE_OK => {
                tracing::debug!(relay_id = self.id, "OK received, waiting for fragments");
                self.set_ready();
                true
            }
            MSG_TYPE_FRAGMENT => {
                let duration_str = message.parameter("duration");

                if duration_str.is_empty() {
                    self.send_error(
                        sink,
                        ERR_FRAGMENT_METADATA,
                        "The fragment duration must be provided",
                    )
                    .await;
                    return false;
                }

                let duration = match duration_str.parse::<f32>() {
                    Ok(duration) => duration,
                    Err(_) => {
                        self.send_error(
                            sink,
                            ERR_FRAGMENT_METADATA,
                            "The fragment duration is not a valid floating point number",
                        )
                        .await;
                        return false;
                    }
                };

                if duration.is_nan() || duration <= 0.0 {
                    self.send_error(
                        sink,
                        ERR_FRAGMENT_METADATA,
                        "The fragment duration must be positive",
                    )
                    .await;
                    return false;
                }

                *staged_duration = Some(duration);
                true
            }
            MSG_TYPE_CLOSE => {
                self.close();
                false
            }
            _ => true,
        }
    }

    async fn send_error(
        &self,
        sink: &Arc<tokio::sync::Mutex<SplitSinkHalf>>,
        code: &str,
        message: &str,
    ) {
        let serialized = ProtocolMessage::error(code, message).serialize();
        let _ = sink.lock().await.send(Message::Text(serialized)).await;
    }

    /// Send heartbeats until the relay closes
    fn spawn_heartbeat_task(
        &self,
        sink: Arc<tokio::sync::Mutex<SplitSinkHalf>>,
    ) -> tokio::task::JoinHandle<()> {
        let mut closed = self.closed_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.changed() => return,
                    _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {
                        let heartbeat = ProtocolMessage::heartbeat().serialize();
                        if sink.lock().await.send(Message::Text(heartbeat)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Probe the listener set until the relay closes itself or externally
    fn spawn_inactivity_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let relay = Arc::clone(self);
        let mut closed = relay.closed_tx.subscribe();
        let period = relay.inactivity_period;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.changed() => return,
                    _ = tokio::time::sleep(period) => {
                        if relay.check_inactivity() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

type SplitSinkHalf = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;
