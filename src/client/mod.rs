//! Publisher client
//!
//! High-level API for pushing a live stream into the CDN. The client owns a
//! reconnection loop (the same driver shape the relay uses for its outbound
//! leg) and a small pending queue so fragments produced while disconnected
//! are not lost.

pub mod config;
pub mod publisher;

pub use config::PublisherConfig;
pub use publisher::{HlsPublisher, PublisherEvent};
