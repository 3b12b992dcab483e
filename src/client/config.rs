//! Publisher client configuration

use std::time::Duration;

/// Configuration for [`crate::client::HlsPublisher`]
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// WebSocket URL of the CDN node to publish to
    pub server_url: String,

    /// Stream ID to publish under
    pub stream_id: String,

    /// Secret used to sign the push token; empty sends an empty token
    pub auth_secret: String,

    /// Delay before re-dialing after an error
    pub connection_retry_delay: Duration,

    /// Max fragments buffered while disconnected; the oldest is evicted
    /// when full
    pub queue_max_length: usize,
}

impl PublisherConfig {
    /// Create a configuration for a server URL and stream ID
    pub fn new(server_url: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            stream_id: stream_id.into(),
            auth_secret: String::new(),
            connection_retry_delay: Duration::from_secs(1),
            queue_max_length: 10,
        }
    }

    /// Set the push-token secret
    pub fn auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth_secret = secret.into();
        self
    }

    /// Set the reconnection delay
    pub fn connection_retry_delay(mut self, delay: Duration) -> Self {
        self.connection_retry_delay = delay;
        self
    }

    /// Set the pending-queue length
    pub fn queue_max_length(mut self, length: usize) -> Self {
        self.queue_max_length = length;
        self
    }
}
