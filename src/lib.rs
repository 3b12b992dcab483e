//! HLS WebSocket CDN
//!
//! A horizontally scalable content-delivery fabric for live HLS streams.
//! Publishers push media fragments over a persistent WebSocket channel;
//! any number of spectators pull the same stream and receive fragments
//! live, with a small buffered backlog so playback starts immediately.
//!
//! Any node can serve any pull: when the requested stream is not published
//! locally, the node opens a relay to the node that owns the publisher,
//! discovered through a shared key/value directory with short TTLs.
//!
//! # Architecture
//!
//! ```text
//!   publisher ──▶ session (PUSH) ──▶ source ──▶ local subscribers
//!                                      │
//!                                      └─▶ announce (stream -> node URL)
//!
//!   spectator ──▶ session (PULL) ──▶ source        (local hit)
//!                                └──▶ relay ──▶ owning node   (miss)
//! ```
//!
//! # Example: embedding a node
//!
//! ```no_run
//! use hlscdn_rs::server::{HlsServer, ServerConfig};
//!
//! # async fn example() -> hlscdn_rs::error::Result<()> {
//! let config = ServerConfig::default().http_port(8080);
//! let server = HlsServer::new(config, None);
//! server.run().await
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod discovery;
pub mod error;
pub mod limits;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod source;

pub use error::{Error, Result};
