//! HTTP listener and websocket upgrader
//!
//! A single listener serves everything: requests under the configured
//! websocket prefix are upgraded to the streaming channel and handed to a
//! session task; every other path answers with a fixed banner. The rate
//! limiter runs before anything else so rejected peers cost one response.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;

use super::config::ServerConfig;
use super::external_url::figure_out_external_websocket_url;
use super::session;
use crate::auth::Authenticator;
use crate::discovery::PublishRegistry;
use crate::error::Result;
use crate::limits::{MemoryLimiter, RateLimiter};
use crate::relay::{RelayRegistry, RelayRegistryConfig};
use crate::source::{SourceRegistry, SourceRegistryConfig};

/// Response body for paths outside the websocket prefix
const DEFAULT_HTTP_RESPONSE: &str = "OK - HLS Websocket CDN";

/// Shared state behind every request and session
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) auth: Arc<Authenticator>,
    pub(crate) sources: Arc<SourceRegistry>,
    pub(crate) relays: Arc<RelayRegistry>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    next_connection_id: AtomicU64,
}

/// The CDN node server
///
/// Wires the auth validator, the limiters, both registries, and the HTTP
/// surface together around one configuration object.
pub struct HlsServer {
    state: Arc<ServerState>,
    external_url: String,
}

impl HlsServer {
    /// Create a server from a configuration and an optional directory
    pub fn new(config: ServerConfig, publish_registry: Option<Arc<dyn PublishRegistry>>) -> Self {
        let external_url = figure_out_external_websocket_url(&config);

        if external_url.is_empty() {
            tracing::warn!(
                "Could not determine the external websocket URL; published streams will not be announced"
            );
        } else {
            tracing::info!(url = %external_url, "External websocket URL");
        }

        let auth = Arc::new(Authenticator::new(config.auth.clone()));
        let memory_limiter = Arc::new(MemoryLimiter::new(config.memory_limiter.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));

        let sources = Arc::new(SourceRegistry::new(
            SourceRegistryConfig {
                fragment_buffer_max_length: config.fragment_buffer_max_length,
                external_url: external_url.clone(),
            },
            memory_limiter.clone(),
            publish_registry.clone(),
        ));

        let relays = Arc::new(RelayRegistry::new(
            RelayRegistryConfig {
                relay_from_url: config.relay_from_url.clone(),
                relay_from_enabled: config.relay_from_enabled,
                fragment_buffer_max_length: config.fragment_buffer_max_length,
                max_binary_message_size: config.max_binary_message_size,
                inactivity_period: config.relay_inactivity_period(),
                external_url: external_url.clone(),
            },
            auth.clone(),
            memory_limiter,
            publish_registry,
        ));

        Self {
            state: Arc::new(ServerState {
                config,
                auth,
                sources,
                relays,
                rate_limiter,
                next_connection_id: AtomicU64::new(0),
            }),
            external_url,
        }
    }

    /// The URL other nodes use to reach this one; empty if unknown
    pub fn external_url(&self) -> &str {
        &self.external_url
    }

    /// Registry of local sources (for inspection)
    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.state.sources
    }

    /// Registry of open relays (for inspection)
    pub fn relays(&self) -> &Arc<RelayRegistry> {
        &self.state.relays
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    ///
    /// Useful for tests and embedders that bind port 0 themselves.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let app = Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone());

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Listening");
        }

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

/// One handler serves every method and path
async fn handle_request(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let ip = addr.ip();

    if !state.rate_limiter.count_request(ip) {
        tracing::debug!(peer = %ip, "Request rejected due to too many requests");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if state.config.log_requests {
        tracing::info!(peer = %ip, path = uri.path(), "HTTP request");
    }

    if uri.path().starts_with(&state.config.websocket_prefix) {
        if let Some(ws) = ws {
            if !state.rate_limiter.start_connection(ip) {
                tracing::debug!(peer = %ip, "Connection rejected due to too many connections");
                return StatusCode::TOO_MANY_REQUESTS.into_response();
            }

            let session_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let max_binary_message_size = state.config.max_binary_message_size;

            return ws
                .max_message_size(max_binary_message_size)
                .max_frame_size(max_binary_message_size)
                .on_upgrade(move |socket| session::run_session(socket, session_id, ip, state))
                .into_response();
        }
    }

    (StatusCode::OK, DEFAULT_HTTP_RESPONSE).into_response()
}
