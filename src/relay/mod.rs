//! Stream relays
//!
//! When a pull misses locally, the node can mirror the stream from the
//! node that owns the publisher (discovered through the publish registry)
//! or from a statically configured upstream. The relay dials out as a
//! subscriber and exposes the mirrored stream through the same ring-buffer
//! and listener surface a local source has, so downstream sessions cannot
//! tell the difference.
//!
//! Relays are created on demand, deduplicated per stream ID, and reap
//! themselves after two consecutive inactivity checks find no listeners.

pub mod relay;
pub mod store;

pub use relay::Relay;
pub use store::{RelayRegistry, RelayRegistryConfig};
