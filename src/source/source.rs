//! Per-stream source

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use super::fragment::{Fragment, SourceEvent};
use crate::limits::MemoryLimiter;

struct SourceState {
    /// Attached listeners, keyed by connection ID
    listeners: HashMap<u64, mpsc::Sender<SourceEvent>>,

    /// Ring of recent fragments
    fragment_buffer: VecDeque<Arc<Fragment>>,

    /// True once closed; closed sources accept no listeners or fragments
    closed: bool,
}

/// The in-memory representation of one live stream
///
/// Owned by exactly one publisher session while open. Listener channels
/// have capacity equal to the ring length, so a just-attached listener can
/// absorb a full ring of broadcasts without dropping.
pub struct Source {
    stream_id: String,
    capacity: usize,
    memory_limiter: Arc<MemoryLimiter>,
    state: Mutex<SourceState>,
    closed_tx: watch::Sender<bool>,
}

impl Source {
    /// Create a new source for a stream
    pub fn new(
        stream_id: impl Into<String>,
        capacity: usize,
        memory_limiter: Arc<MemoryLimiter>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);

        Self {
            stream_id: stream_id.into(),
            capacity: capacity.max(1),
            memory_limiter,
            state: Mutex::new(SourceState {
                listeners: HashMap::new(),
                fragment_buffer: VecDeque::new(),
                closed: false,
            }),
            closed_tx,
        }
    }

    /// Stream ID this source carries
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether the source has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Watch channel that flips to true when the source closes
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Attach a listener
    ///
    /// Returns the event channel and a point-in-time snapshot of the ring
    /// (in publish order), or `None` if the source is already closed.
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

    /// Append a fragment and broadcast it to every listener
    ///
    /// No-op when closed. The memory limiter may trim the ring or reject
    /// the fragment outright; rejected fragments are not broadcast. A full
    /// ring rotates its oldest fragment out. Broadcast never blocks: a
    /// listener whose channel is full misses this fragment.
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

        for listener in state.listeners.values() {
            let _ = listener.try_send(SourceEvent::Fragment(fragment.clone()));
        }
    }

    /// Close the source
    ///
    /// Broadcasts `Close`, detaches every listener (dropping their senders,
    /// which also ends their channels), releases the ring from the memory
    /// budget, and stops the announce timer. Idempotent.
    pub fn close(&self) {
        let buffer = {
            let mut state = self.state.lock().unwrap();

            if state.closed {
                return;
            }

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
}
