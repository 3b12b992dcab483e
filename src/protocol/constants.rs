//! Protocol constants

use std::time::Duration;

/// Period between heartbeat (`H`) messages, both directions
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Read limit for text messages (guards against oversized command frames)
pub const TEXT_MESSAGE_READ_LIMIT: usize = 1600;

/// Default read limit for binary messages (50 MiB)
pub const DEFAULT_MAX_BINARY_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Default max length of the per-stream fragment ring buffer
pub const DEFAULT_FRAGMENT_BUFFER_MAX_LENGTH: usize = 10;

/// Maximum length of a stream ID in bytes
pub const STREAM_ID_MAX_LENGTH: usize = 255;

/// Message type: publisher opening message
pub const MSG_TYPE_PUSH: &str = "PUSH";

/// Message type: subscriber opening message
pub const MSG_TYPE_PULL: &str = "PULL";

/// Message type: admission accepted
pub const MSG_TYPE_OK: &str = "OK";

/// Message type: error notification
pub const MSG_TYPE_ERROR: &str = "E";

/// Message type: fragment metadata, followed by one binary frame
pub const MSG_TYPE_FRAGMENT: &str = "F";

/// Message type: heartbeat
pub const MSG_TYPE_HEARTBEAT: &str = "H";

/// Message type: orderly shutdown
pub const MSG_TYPE_CLOSE: &str = "CLOSE";

/// Error code: bad message type, order, or framing
pub const ERR_PROTOCOL: &str = "PROTOCOL_ERROR";

/// Error code: invalid or missing auth token, or push disallowed
pub const ERR_AUTH: &str = "AUTH_ERROR";

/// Error code: stream could not be published
pub const ERR_PUSH: &str = "PUSH_ERROR";

/// Error code: missing or invalid fragment duration
pub const ERR_FRAGMENT_METADATA: &str = "FRAGMENT_METADATA_ERROR";
