//! Redis-backed publish registry
//!
//! Keys are raw stream IDs, values are publisher URLs, written with
//! `SET ... EX <2 x refresh interval>`.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use super::PublishRegistry;
use crate::error::Result;

/// Redis publish registry configuration
#[derive(Debug, Clone)]
pub struct RedisPublishRegistryConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Password, empty for none
    pub password: String,

    /// True to connect with TLS
    pub use_tls: bool,

    /// Seconds between announce refreshes
    pub refresh_interval_seconds: u64,
}

impl Default for RedisPublishRegistryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            use_tls: false,
            refresh_interval_seconds: 60,
        }
    }
}

/// Publish registry backed by a Redis database
pub struct RedisPublishRegistry {
    config: RedisPublishRegistryConfig,
    client: redis::Client,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisPublishRegistry {
    /// Create a new registry client; the connection is established lazily
    pub fn new(config: RedisPublishRegistryConfig) -> Result<Self> {
        let scheme = if config.use_tls { "rediss" } else { "redis" };

        let url = if config.password.is_empty() {
            format!("{}://{}:{}", scheme, config.host, config.port)
        } else {
            format!(
                "{}://:{}@{}:{}",
                scheme, config.password, config.host, config.port
            )
        };

        let client = redis::Client::open(url)?;

        Ok(Self {
            config,
            client,
            connection: Mutex::new(None),
        })
    }

    /// Get the shared multiplexed connection, dialing if necessary
    ///
    /// A failed command clears the cached connection so the next call
    /// re-dials.
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.client.get_multiplexed_tokio_connection().await?;
        *guard = Some(connection.clone());

        Ok(connection)
    }

    async fn invalidate_connection(&self) {
        let mut guard = self.connection.lock().await;
        *guard = None;
    }
}

#[async_trait]
impl PublishRegistry for RedisPublishRegistry {
    async fn get_publishing_server(&self, stream_id: &str) -> Result<Option<String>> {
        let mut connection = self.connection().await?;

        let value: Option<String> = match connection.get(stream_id).await {
            Ok(value) => value,
            Err(e) => {
                self.invalidate_connection().await;
                return Err(e.into());
            }
        };

        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn announce(&self, stream_id: &str, url: &str) -> Result<()> {
        let mut connection = self.connection().await?;
        let ttl = self.config.refresh_interval_seconds * 2;

        if let Err(e) = connection.set_ex::<_, _, ()>(stream_id, url, ttl).await {
            self.invalidate_connection().await;
            return Err(e.into());
        }

        Ok(())
    }

    fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.config.refresh_interval_seconds.max(1))
    }
}
