//! Fragment and listener event types

use bytes::Bytes;
use std::sync::Arc;

/// One encoded media segment
///
/// Immutable once constructed. `Bytes` is reference counted, so sharing a
/// fragment with every attached listener never copies the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Duration of the fragment in seconds
    pub duration: f32,

    /// Fragment payload
    pub data: Bytes,
}

impl Fragment {
    /// Create a new fragment
    pub fn new(duration: f32, data: Bytes) -> Self {
        Self { duration, data }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Event delivered to an attached listener
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A new fragment was appended to the source
    Fragment(Arc<Fragment>),

    /// The source closed; no more fragments will follow
    Close,
}
