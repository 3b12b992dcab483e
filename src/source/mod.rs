//! Stream sources
//!
//! A source is the in-memory representation of one live stream: a bounded
//! ring of recent fragments (so late joiners can start playback right away)
//! plus the set of attached listeners that new fragments fan out to.
//!
//! ```text
//!                        Arc<SourceRegistry>
//!                  ┌──────────────────────────┐
//!                  │ sources: HashMap<String, │
//!                  │   Arc<Source> {          │
//!                  │     fragment ring,       │
//!                  │     listeners,           │
//!                  │   }                      │
//!                  │ >                        │
//!                  └────────────┬─────────────┘
//!                               │
//!            ┌──────────────────┼──────────────────┐
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!       [Publisher]       [Subscriber]       [Subscriber]
//!       add_fragment()    events.recv()      events.recv()
//! ```
//!
//! Fan-out is drop-on-full per listener: a subscriber that cannot keep up
//! loses fragments instead of stalling the publisher.

pub mod fragment;
pub mod source;
pub mod store;

pub use fragment::{Fragment, SourceEvent};
pub use source::Source;
pub use store::{SourceRegistry, SourceRegistryConfig};
