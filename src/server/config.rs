//! Server configuration
//!
//! Flat key/value configuration loaded from the environment. Every option
//! has a default suitable for a single-node deployment; the directory
//! backend and the limiters are opt-in.

use std::time::Duration;

use crate::auth::AuthConfig;
use crate::discovery::RedisPublishRegistryConfig;
use crate::limits::{MemoryLimiterConfig, RateLimiterConfig};
use crate::protocol::{DEFAULT_FRAGMENT_BUFFER_MAX_LENGTH, DEFAULT_MAX_BINARY_MESSAGE_SIZE};

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Serve plain HTTP
    pub http_enabled: bool,

    /// HTTP port
    pub http_port: u16,

    /// Bind address; empty binds all interfaces
    pub bind_address: String,

    /// Whether a TLS terminator fronts this node (affects the derived
    /// external URL scheme and port; termination itself is external)
    pub tls_enabled: bool,

    /// TLS port
    pub tls_port: u16,

    /// Paths with this prefix are upgraded to the streaming channel
    pub websocket_prefix: String,

    /// Read limit for binary messages, in bytes
    pub max_binary_message_size: usize,

    /// Ring capacity per source/relay
    pub fragment_buffer_max_length: usize,

    /// URL other nodes use to reach this one; empty derives it from the
    /// first usable interface address
    pub external_websocket_url: String,

    /// Log every HTTP request
    pub log_requests: bool,

    /// Static upstream to relay from when discovery finds nothing
    pub relay_from_url: String,

    /// True if the static upstream is enabled
    pub relay_from_enabled: bool,

    /// Seconds between relay inactivity checks
    pub relay_inactivity_period_seconds: u64,

    /// Auth secrets and push policy
    pub auth: AuthConfig,

    /// Global fragment-memory budget
    pub memory_limiter: MemoryLimiterConfig,

    /// Per-IP rate limits
    pub rate_limiter: RateLimiterConfig,

    /// Directory backend; `None` disables discovery
    pub redis_registry: Option<RedisPublishRegistryConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_enabled: true,
            http_port: 80,
            bind_address: String::new(),
            tls_enabled: false,
            tls_port: 443,
            websocket_prefix: "/".to_string(),
            max_binary_message_size: DEFAULT_MAX_BINARY_MESSAGE_SIZE,
            fragment_buffer_max_length: DEFAULT_FRAGMENT_BUFFER_MAX_LENGTH,
            external_websocket_url: String::new(),
            log_requests: true,
            relay_from_url: String::new(),
            relay_from_enabled: false,
            relay_inactivity_period_seconds: 30,
            auth: AuthConfig {
                pull_secret: String::new(),
                push_secret: String::new(),
                allow_push: true,
            },
            memory_limiter: MemoryLimiterConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            redis_registry: None,
        }
    }
}

impl ServerConfig {
    /// Load the configuration from environment variables
    pub fn from_env() -> Self {
        let redis_registry = if env_bool("PUB_REG_REDIS_ENABLED", false) {
            Some(RedisPublishRegistryConfig {
                host: env_string("PUB_REG_REDIS_HOST", "127.0.0.1"),
                port: env_u16("PUB_REG_REDIS_PORT", 6379),
                password: env_string("PUB_REG_REDIS_PASSWORD", ""),
                use_tls: env_bool("PUB_REG_REDIS_USE_TLS", false),
                refresh_interval_seconds: env_u64("PUB_REG_REFRESH_INTERVAL_SECONDS", 60),
            })
        } else {
            None
        };

        Self {
            http_enabled: env_bool("HTTP_ENABLED", true),
            http_port: env_u16("HTTP_PORT", 80),
            bind_address: env_string("HTTP_BIND_ADDRESS", ""),
            tls_enabled: env_bool("TLS_ENABLED", false),
            tls_port: env_u16("TLS_PORT", 443),
            websocket_prefix: env_string("WEBSOCKET_PREFIX", "/"),
            max_binary_message_size: env_usize(
                "MAX_BINARY_MESSAGE_SIZE",
                DEFAULT_MAX_BINARY_MESSAGE_SIZE,
            ),
            fragment_buffer_max_length: env_usize(
                "FRAGMENT_BUFFER_MAX_LENGTH",
                DEFAULT_FRAGMENT_BUFFER_MAX_LENGTH,
            ),
            external_websocket_url: env_string("EXTERNAL_WEBSOCKET_URL", ""),
            log_requests: env_bool("LOG_REQUESTS", true),
            relay_from_url: env_string("RELAY_FROM_URL", ""),
            relay_from_enabled: env_bool("RELAY_FROM_ENABLED", false),
            relay_inactivity_period_seconds: env_u64("RELAY_INACTIVITY_PERIOD_SECONDS", 30),
            auth: AuthConfig {
                pull_secret: env_string("PULL_SECRET", ""),
                push_secret: env_string("PUSH_SECRET", ""),
                allow_push: env_bool("PUSH_ALLOWED", true),
            },
            memory_limiter: MemoryLimiterConfig {
                enabled: env_bool("BUFFER_MEMORY_LIMITER_ENABLED", false),
                limit: env_u64("BUFFER_MEMORY_LIMIT_MB", 256) * 1024 * 1024,
            },
            rate_limiter: RateLimiterConfig {
                enabled: env_bool("RATE_LIMIT_ENABLED", false),
                whitelist: env_string("RATE_LIMIT_WHITELIST", ""),
                max_connections: env_usize("RATE_LIMIT_CONNECTIONS", 0),
                max_requests_per_second: env_u32("RATE_LIMIT_REQ_PER_SEC", 0),
                request_burst: env_u32("RATE_LIMIT_REQ_BURST", 0),
                cleanup_interval_seconds: env_i64("RATE_LIMIT_REQ_CLEANUP", 10),
            },
            redis_registry,
        }
    }

    /// Address the HTTP listener binds to
    pub fn bind_addr(&self) -> String {
        let host = if self.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            &self.bind_address
        };

        format!("{}:{}", host, self.http_port)
    }

    /// Interval between relay inactivity checks
    pub fn relay_inactivity_period(&self) -> Duration {
        Duration::from_secs(self.relay_inactivity_period_seconds.max(1))
    }

    /// Set the HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the websocket path prefix
    pub fn websocket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.websocket_prefix = prefix.into();
        self
    }

    /// Set the ring capacity per source/relay
    pub fn fragment_buffer_max_length(mut self, length: usize) -> Self {
        self.fragment_buffer_max_length = length;
        self
    }

    /// Set the external websocket URL announced to the directory
    pub fn external_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.external_websocket_url = url.into();
        self
    }

    /// Set (and enable) the static relay upstream
    pub fn relay_from(mut self, url: impl Into<String>) -> Self {
        self.relay_from_url = url.into();
        self.relay_from_enabled = true;
        self
    }

    /// Set the auth configuration
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.to_lowercase().as_str(),
            "true" | "yes" | "y" | "1" | "on"
        ),
        Err(_) => default,
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
