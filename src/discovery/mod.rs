//! Publish registry (cluster directory)
//!
//! The directory maps each live stream ID to the WebSocket URL of the node
//! currently publishing it. Publisher-owning nodes re-announce their entry
//! on a fixed interval; entries are written with a TTL of twice that
//! interval so they disappear shortly after the publisher leaves. Absence
//! of an entry means "no known publisher" and is not an error.

pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::redis::{RedisPublishRegistry, RedisPublishRegistryConfig};

/// Directory of publishing nodes, keyed by stream ID
#[async_trait]
pub trait PublishRegistry: Send + Sync {
    /// Gets the URL of the node publishing a stream, if any is known
    async fn get_publishing_server(&self, stream_id: &str) -> Result<Option<String>>;

    /// Announces that this node (at `url`) is publishing a stream
    ///
    /// Must be called periodically; the entry expires after twice the
    /// announce interval.
    async fn announce(&self, stream_id: &str, url: &str) -> Result<()>;

    /// Interval between announces
    fn announce_interval(&self) -> Duration;
}
