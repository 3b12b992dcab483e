//! CDN node server binary
//!
//! Loads the configuration from the environment, initializes logging, and
//! runs the node until the listener stops. Exits non-zero on bind failure
//! or fatal configuration errors.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use hlscdn_rs::discovery::{PublishRegistry, RedisPublishRegistry};
use hlscdn_rs::server::{HlsServer, ServerConfig};

/// Map the LOG_* flags onto a tracing filter
fn log_filter() -> EnvFilter {
    let flag = |key: &str, default: bool| {
        std::env::var(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "yes" | "y" | "1" | "on"))
            .unwrap_or(default)
    };

    let level = if flag("LOG_TRACE", false) {
        "trace"
    } else if flag("LOG_DEBUG", false) {
        "debug"
    } else if flag("LOG_INFO", true) {
        "info"
    } else if flag("LOG_WARNING", true) {
        "warn"
    } else if flag("LOG_ERROR", true) {
        "error"
    } else {
        "off"
    };

    EnvFilter::new(format!("hlscdn_rs={level},hlscdn_server={level}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let config = ServerConfig::from_env();

    if !config.http_enabled {
        tracing::error!("HTTP_ENABLED=false leaves this node with no listener");
        std::process::exit(1);
    }

    let publish_registry: Option<Arc<dyn PublishRegistry>> = match &config.redis_registry {
        Some(redis_config) => match RedisPublishRegistry::new(redis_config.clone()) {
            Ok(registry) => {
                tracing::info!("Initialized publish registry");
                Some(Arc::new(registry))
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not initialize publish registry");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let server = HlsServer::new(config, publish_registry);

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
