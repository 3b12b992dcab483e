//! Session handler
//!
//! One task per accepted connection, driving the protocol state machine:
//!
//! ```text
//!   Unclaimed ──PUSH──▶ Publishing ──CLOSE/error/disconnect──▶ Closed
//!       │
//!       └────PULL──▶ Subscribing ──close/error/disconnect────▶ Closed
//! ```
//!
//! The read loop enforces a deadline of one heartbeat period while
//! unclaimed and two once claimed; a background task sends `H` every
//! period so healthy peers never hit it. Sessions never transition
//! backwards; any violation sends an `E` message and ends the connection.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use tokio::sync::watch;

use super::listener::ServerState;
use super::pull::{self, SessionWriter};
use crate::protocol::{
    ProtocolMessage, ERR_AUTH, ERR_FRAGMENT_METADATA, ERR_PROTOCOL, HEARTBEAT_PERIOD,
    MSG_TYPE_CLOSE, MSG_TYPE_ERROR, MSG_TYPE_FRAGMENT, MSG_TYPE_HEARTBEAT, MSG_TYPE_PULL,
    MSG_TYPE_PUSH, STREAM_ID_MAX_LENGTH, TEXT_MESSAGE_READ_LIMIT,
};
use crate::source::{Fragment, Source};

/// Operating mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMode {
    /// Connected, first message not received yet
    Unclaimed,

    /// Publishing fragments into a source
    Publishing,

    /// Receiving fragments through the pull task
    Subscribing,
}

struct Session {
    id: u64,
    state: Arc<ServerState>,
    writer: SessionWriter,
    mode: SessionMode,
    stream_id: String,
    source: Option<Arc<Source>>,
    staged_duration: Option<f32>,
    pull_interrupt: Option<watch::Sender<bool>>,
}

/// Run one inbound session until it ends, then release its resources
pub(crate) async fn run_session(
    socket: WebSocket,
    session_id: u64,
    ip: IpAddr,
    state: Arc<ServerState>,
) {
    tracing::info!(session_id, peer = %ip, "Connection established");

    let (sink, mut reader) = socket.split();
    let writer: SessionWriter = Arc::new(tokio::sync::Mutex::new(sink));

    let heartbeat_handle = spawn_heartbeat_task(writer.clone());

    let mut session = Session {
        id: session_id,
        state: state.clone(),
        writer,
        mode: SessionMode::Unclaimed,
        stream_id: String::new(),
        source: None,
        staged_duration: None,
        pull_interrupt: None,
    };

    loop {
        let deadline = match session.mode {
            SessionMode::Unclaimed => HEARTBEAT_PERIOD,
            _ => HEARTBEAT_PERIOD * 2,
        };

        let message = match tokio::time::timeout(deadline, reader.next()).await {
            Err(_) => break, // read deadline expired
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };

        let keep_going = match message {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Binary(data) => session.handle_binary(data).await,
            Message::Close(_) => false,
            Message::Ping(_) | Message::Pong(_) => true,
        };

        if !keep_going {
            break;
        }
    }

    heartbeat_handle.abort();
    session.teardown();

    state.rate_limiter.end_connection(ip);

    tracing::info!(session_id, "Connection closed");
}

/// Send `H` every heartbeat period until the session ends
fn spawn_heartbeat_task(writer: SessionWriter) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_PERIOD).await;

            if !pull::send_message(&writer, &ProtocolMessage::heartbeat()).await {
                return;
            }
        }
    })
}

impl Session {
    async fn send(&self, message: &ProtocolMessage) {
        tracing::trace!(session_id = self.id, message = %message, ">>>");
        pull::send_message(&self.writer, message).await;
    }

    async fn send_error(&self, code: &str, message: &str) {
        self.send(&ProtocolMessage::error(code, message)).await;
    }

    /// Handle one text frame; false ends the connection
    async fn handle_text(&mut self, text: &str) -> bool {
        if self.staged_duration.is_some() {
            self.send_error(ERR_PROTOCOL, "Expected a binary message, but received a text one")
                .await;
            return false;
        }

        if text.len() > TEXT_MESSAGE_READ_LIMIT {
            self.send_error(ERR_PROTOCOL, "Text message exceeds the allowed size")
                .await;
            return false;
        }

        tracing::trace!(session_id = self.id, message = text, "<<<");

        let message = ProtocolMessage::parse(text);

        match message.message_type.as_str() {
            MSG_TYPE_ERROR => {
                tracing::debug!(
                    session_id = self.id,
                    code = message.parameter("code"),
                    message = message.parameter("message"),
                    "Error from client"
                );
                false
            }
            MSG_TYPE_HEARTBEAT => true,
            MSG_TYPE_PULL => self.handle_pull(&message).await,
            MSG_TYPE_PUSH => self.handle_push(&message).await,
            MSG_TYPE_FRAGMENT => self.handle_fragment_metadata(&message).await,
            MSG_TYPE_CLOSE => self.handle_close().await,
            _ => {
                if self.mode == SessionMode::Unclaimed {
                    self.send_error(
                        ERR_PROTOCOL,
                        "Expected an action message (PUSH, PULL) as the first message",
                    )
                    .await;
                    return false;
                }

                // Unknown types are ignored once claimed, for forward
                // compatibility
                true
            }
        }
    }

    /// Validate the `stream` parameter of an opening message
    async fn validate_stream_id(&self, message: &ProtocolMessage) -> Option<String> {
        let stream_id = message.parameter("stream");

        if stream_id.is_empty() {
            self.send_error(ERR_PROTOCOL, "Stream ID cannot be empty").await;
            return None;
        }

        if stream_id.len() > STREAM_ID_MAX_LENGTH {
            self.send_error(ERR_PROTOCOL, "Stream ID cannot be larger than 255 characters")
                .await;
            return None;
        }

        Some(stream_id.to_string())
    }

    /// Handle the `PUSH` opening message
    async fn handle_push(&mut self, message: &ProtocolMessage) -> bool {
        if self.mode != SessionMode::Unclaimed {
            self.send_error(ERR_PROTOCOL, "A PUSH message may only be sent as the first message")
                .await;
            return false;
        }

        if !self.state.auth.is_push_allowed() {
            self.send_error(ERR_AUTH, "Pushing streams is not allowed on this node")
                .await;
            return false;
        }

        let stream_id = match self.validate_stream_id(message).await {
            Some(stream_id) => stream_id,
            None => return false,
        };

        if !self
            .state
            .auth
            .validate_push_token(message.parameter("auth"), &stream_id)
        {
            self.send_error(ERR_AUTH, "Invalid auth token").await;
            return false;
        }

        // One publisher wins: this displaces (and closes) any prior source
        let source = self.state.sources.create_source(&stream_id);

        tracing::info!(session_id = self.id, stream = %stream_id, "Publishing");

        self.source = Some(source);
        self.stream_id = stream_id;
        self.mode = SessionMode::Publishing;

        self.send(&ProtocolMessage::ok()).await;

        true
    }

    /// Handle the `PULL` opening message
    async fn handle_pull(&mut self, message: &ProtocolMessage) -> bool {
        if self.mode != SessionMode::Unclaimed {
            self.send_error(ERR_PROTOCOL, "A PULL message may only be sent as the first message")
                .await;
            return false;
        }

        let stream_id = match self.validate_stream_id(message).await {
            Some(stream_id) => stream_id,
            None => return false,
        };

        if !self
            .state
            .auth
            .validate_pull_token(message.parameter("auth"), &stream_id)
        {
            self.send_error(ERR_AUTH, "Invalid auth token").await;
            return false;
        }

        let only_source = message.parameter("only_source") == "true";

        let mut max_initial_fragments: i64 = -1;
        let max_initial_str = message.parameter("max_initial_fragments");

        if !max_initial_str.is_empty() {
            match max_initial_str.parse::<i64>() {
                Ok(n) => max_initial_fragments = n,
                Err(_) => {
                    self.send_error(
                        ERR_PROTOCOL,
                        "max_initial_fragments must be a valid integer number",
                    )
                    .await;
                    return false;
                }
            }
        }

        // Prefer the local source; nodes that do not accept publishers
        // cannot have one
        if self.state.auth.is_push_allowed() {
            if let Some(source) = self.state.sources.get_source(&stream_id) {
                self.send(&ProtocolMessage::ok()).await;

                let interrupt = self.make_pull_interrupt();
                tokio::spawn(pull::pull_from_source(
                    source,
                    self.id,
                    self.writer.clone(),
                    interrupt,
                    max_initial_fragments,
                ));

                tracing::info!(session_id = self.id, stream = %stream_id, "Subscribed to local source");

                self.stream_id = stream_id;
                self.mode = SessionMode::Subscribing;

                return true;
            }
        }

        if !only_source {
            if let Some(relay) = self.state.relays.relay_stream(&stream_id).await {
                self.send(&ProtocolMessage::ok()).await;

                let interrupt = self.make_pull_interrupt();
                tokio::spawn(pull::pull_from_relay(
                    relay,
                    self.id,
                    self.writer.clone(),
                    interrupt,
                    max_initial_fragments,
                ));

                tracing::info!(session_id = self.id, stream = %stream_id, "Subscribed through relay");

                self.stream_id = stream_id;
                self.mode = SessionMode::Subscribing;

                return true;
            }
        }

        // No source and no relay route: admit, then close (empty stream)
        self.send(&ProtocolMessage::ok()).await;
        self.send(&ProtocolMessage::close()).await;

        false
    }

    fn make_pull_interrupt(&mut self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.pull_interrupt = Some(tx);
        rx
    }

    /// Handle an `F` fragment-metadata message
    async fn handle_fragment_metadata(&mut self, message: &ProtocolMessage) -> bool {
        if self.mode != SessionMode::Publishing {
            self.send_error(ERR_PROTOCOL, "A fragment message can only be sent in PUSH mode")
                .await;
            return false;
        }

        let duration_str = message.parameter("duration");

        if duration_str.is_empty() {
            self.send_error(ERR_FRAGMENT_METADATA, "The fragment duration must be provided")
                .await;
            return false;
        }

        let duration = match duration_str.parse::<f32>() {
            Ok(duration) => duration,
            Err(_) => {
                self.send_error(
                    ERR_FRAGMENT_METADATA,
                    "The fragment duration is not a valid floating point number",
                )
                .await;
                return false;
            }
        };

        if duration.is_nan() || duration <= 0.0 {
            self.send_error(ERR_FRAGMENT_METADATA, "The fragment duration must be positive")
                .await;
            return false;
        }

        self.staged_duration = Some(duration);

        true
    }

    /// Handle a binary frame carrying a fragment payload
    async fn handle_binary(&mut self, data: Vec<u8>) -> bool {
        let duration = match self.staged_duration.take() {
            Some(duration) => duration,
            None => {
                self.send_error(ERR_PROTOCOL, "Unexpected binary message").await;
                return false;
            }
        };

        let source = match &self.source {
            Some(source) => source.clone(),
            None => {
                self.send_error(ERR_PROTOCOL, "Unexpected binary message").await;
                return false;
            }
        };

        if data.is_empty() {
            self.send_error(ERR_PROTOCOL, "Unexpected empty binary message")
                .await;
            return false;
        }

        source.add_fragment(Arc::new(Fragment::new(duration, data.into())));

        true
    }

    /// Handle the publisher's `CLOSE` message
    async fn handle_close(&mut self) -> bool {
        if self.mode != SessionMode::Publishing {
            self.send_error(ERR_PROTOCOL, "A close message can only be sent in PUSH mode")
                .await;
            return false;
        }

        match self.source.take() {
            Some(source) => {
                source.close();
                self.state.sources.remove_source(&self.stream_id, &source);
            }
            None => {
                self.send_error(ERR_PROTOCOL, "Unexpected close message").await;
            }
        }

        // The connection closes after an orderly CLOSE
        false
    }

    /// Release everything the session still holds
    fn teardown(&mut self) {
        if let Some(source) = self.source.take() {
            source.close();
            self.state.sources.remove_source(&self.stream_id, &source);
            tracing::info!(session_id = self.id, "Source closed due to connection closed");
        }

        if let Some(interrupt) = self.pull_interrupt.take() {
            let _ = interrupt.send(true);
        }
    }
}
