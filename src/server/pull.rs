//! Subscriber pull dispatch
//!
//! Once a session is admitted as a subscriber, a dedicated task streams
//! fragments to it: first the ring snapshot (bounded by
//! `max_initial_fragments`), then live events from the listener channel
//! until the stream closes or the session tears down.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::{mpsc, watch};

use crate::protocol::ProtocolMessage;
use crate::relay::Relay;
use crate::source::{Fragment, Source, SourceEvent};

/// Write half of a session socket, shared between the read loop, the
/// heartbeat task, and the pull task
pub(crate) type SessionWriter = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// Send a text message to the peer; false means the socket is gone
pub(crate) async fn send_message(writer: &SessionWriter, message: &ProtocolMessage) -> bool {
    writer
        .lock()
        .await
        .send(Message::Text(message.serialize()))
        .await
        .is_ok()
}

/// Send one fragment as `F:duration=<secs>` followed by its binary payload
pub(crate) async fn send_fragment(writer: &SessionWriter, fragment: &Fragment) -> bool {
    let mut sink = writer.lock().await;

    if sink
        .send(Message::Text(
            ProtocolMessage::fragment(fragment.duration).serialize(),
        ))
        .await
        .is_err()
    {
        return false;
    }

    sink.send(Message::Binary(fragment.data.to_vec()))
        .await
        .is_ok()
}

/// Send `CLOSE` and initiate the websocket close handshake
async fn send_close(writer: &SessionWriter) {
    let mut sink = writer.lock().await;

    let _ = sink
        .send(Message::Text(ProtocolMessage::close().serialize()))
        .await;
    let _ = sink.send(Message::Close(None)).await;
}

/// Pull a stream from a local source
pub(crate) async fn pull_from_source(
    source: Arc<Source>,
    connection_id: u64,
    writer: SessionWriter,
    interrupt: watch::Receiver<bool>,
    max_initial_fragments: i64,
) {
    let (events, initial) = match source.add_listener(connection_id) {
        Some(attached) => attached,
        None => {
            send_close(&writer).await;
            return;
        }
    };

    pull_stream(events, interrupt, initial, max_initial_fragments, &writer).await;

    source.remove_listener(connection_id);
}

/// Pull a stream from a relay
///
/// Waits for the relay's ready gate first: the relay is ready once the
/// upstream answered `OK` or the dial failed, so attaching afterwards
/// yields either buffered fragments or a prompt close.
pub(crate) async fn pull_from_relay(
    relay: Arc<Relay>,
    connection_id: u64,
    writer: SessionWriter,
    interrupt: watch::Receiver<bool>,
    max_initial_fragments: i64,
) {
    relay.wait_until_ready().await;

    let (events, initial) = match relay.add_listener(connection_id) {
        Some(attached) => attached,
        None => {
            send_close(&writer).await;
            return;
        }
    };

    pull_stream(events, interrupt, initial, max_initial_fragments, &writer).await;

    relay.remove_listener(connection_id);
}

/// Stream the snapshot, then live events, until close or interrupt
async fn pull_stream(
    mut events: mpsc::Receiver<SourceEvent>,
    mut interrupt: watch::Receiver<bool>,
    initial: Vec<Arc<Fragment>>,
    max_initial_fragments: i64,
    writer: &SessionWriter,
) {
    let initial_limit = if max_initial_fragments < 0 {
        initial.len()
    } else {
        max_initial_fragments as usize
    };

    for fragment in initial.iter().take(initial_limit) {
        if !send_fragment(writer, fragment).await {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = interrupt.changed() => {
                return;
            }
            event = events.recv() => {
                match event {
                    Some(SourceEvent::Fragment(fragment)) => {
                        if !send_fragment(writer, &fragment).await {
                            return;
                        }
                    }
                    Some(SourceEvent::Close) | None => {
                        send_close(writer).await;
                        return;
                    }
                }
            }
        }
    }
}
