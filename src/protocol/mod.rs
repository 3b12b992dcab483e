//! Wire protocol for the streaming channel
//!
//! The protocol is carried over a persistent WebSocket connection and mixes
//! framed text commands with raw binary payloads:
//!
//! ```text
//!   TYPE[:k1=v1&k2=v2&...]     text frame, URL-encoded parameters
//!   <bytes>                    binary frame, only valid right after an F
//! ```
//!
//! A publisher opens with `PUSH`, then alternates `F:duration=<secs>` text
//! frames with the fragment payloads. A subscriber opens with `PULL` and
//! receives the same interleaving back. `H` heartbeats flow both ways to
//! keep read deadlines from firing on quiet streams.

pub mod constants;
pub mod message;

pub use constants::*;
pub use message::ProtocolMessage;
