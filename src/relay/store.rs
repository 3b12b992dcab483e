//! Relay registry
//!
//! Deduplicated, on-demand relay creation. A pull miss asks the registry to
//! find a route: an existing open relay, the publish registry's entry for
//! the stream, or the statically configured fallback upstream. Creation is
//! guarded against lost updates by re-checking under the lock, and closed
//! relays remove themselves so the next pull re-attempts discovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::relay::Relay;
use crate::auth::Authenticator;
use crate::discovery::PublishRegistry;
use crate::limits::MemoryLimiter;

/// Relay registry configuration
#[derive(Debug, Clone)]
pub struct RelayRegistryConfig {
    /// WebSocket URL of another node to relay streams from
    pub relay_from_url: String,

    /// True if the static fallback upstream is enabled
    pub relay_from_enabled: bool,

    /// Ring capacity for new relays
    pub fragment_buffer_max_length: usize,

    /// Read limit for relayed binary messages
    pub max_binary_message_size: usize,

    /// Interval between relay inactivity checks
    pub inactivity_period: Duration,

    /// This node's own external URL; directory entries pointing here are
    /// skipped so a node never relays from itself
    pub external_url: String,
}

impl Default for RelayRegistryConfig {
    fn default() -> Self {
        Self {
            relay_from_url: String::new(),
            relay_from_enabled: false,
            fragment_buffer_max_length: crate::protocol::DEFAULT_FRAGMENT_BUFFER_MAX_LENGTH,
            max_binary_message_size: crate::protocol::DEFAULT_MAX_BINARY_MESSAGE_SIZE,
            inactivity_period: Duration::from_secs(30),
            external_url: String::new(),
        }
    }
}

struct RelayRegistryState {
    relays: HashMap<String, Arc<Relay>>,
    next_relay_id: u64,
}

/// Registry of the open relays on this node
pub struct RelayRegistry {
    config: RelayRegistryConfig,
    auth: Arc<Authenticator>,
    memory_limiter: Arc<MemoryLimiter>,
    publish_registry: Option<Arc<dyn PublishRegistry>>,
    state: Mutex<RelayRegistryState>,
}

impl RelayRegistry {
    /// Create a new relay registry
    pub fn new(
        config: RelayRegistryConfig,
        auth: Arc<Authenticator>,
        memory_limiter: Arc<MemoryLimiter>,
        publish_registry: Option<Arc<dyn PublishRegistry>>,
    ) -> Self {
        Self {
            config,
            auth,
            memory_limiter,
            publish_registry,
            state: Mutex::new(RelayRegistryState {
                relays: HashMap::new(),
                next_relay_id: 0,
            }),
        }
    }

    /// Get the existing relay for a stream, if any
    pub fn get_relay(&self, stream_id: &str) -> Option<Arc<Relay>> {
        self.state.lock().unwrap().relays.get(stream_id).cloned()
    }

    /// Number of registered relays
    pub fn relay_count(&self) -> usize {
        self.state.lock().unwrap().relays.len()
    }

    /// Called by a relay's run loop after it closed
    ///
    /// Removes the entry only if it still refers to that relay, so a fresh
    /// replacement created in the meantime survives.
    pub fn on_relay_closed(&self, relay: &Arc<Relay>) {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.relays.get(relay.stream_id()) {
            if existing.id() == relay.id() {
                state.relays.remove(relay.stream_id());
            }
        }
    }

    /// Get the open relay for a stream or create (and spawn) a new one
    ///
    /// Re-checks for an existing relay under the lock: two pulls racing on
    /// the same miss must share one relay.
    pub fn get_relay_or_create(
        self: &Arc<Self>,
        stream_id: &str,
        relay_url: &str,
        only_source: bool,
    ) -> Arc<Relay> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.relays.get(stream_id) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        let relay_id = state.next_relay_id;
        state.next_relay_id += 1;

        let relay = Arc::new(Relay::new(
            relay_id,
            relay_url,
            stream_id,
            only_source,
            self.config.fragment_buffer_max_length,
            self.config.max_binary_message_size,
            self.config.inactivity_period,
            self.auth.clone(),
            self.memory_limiter.clone(),
        ));

        state.relays.insert(stream_id.to_string(), relay.clone());

        let registry = self.clone();
        let spawned = relay.clone();

        tokio::spawn(async move {
            spawned.clone().run().await;
            registry.on_relay_closed(&spawned);
        });

        relay
    }

    /// Find (or open) a relay for a stream
    ///
    /// Resolution order: existing open relay, publish registry entry
    /// (dialed with `only_source=true` since the target owns the
    /// publisher), then the static fallback upstream. `None` means no
    /// route exists. The caller must still wait for readiness.
    pub async fn relay_stream(self: &Arc<Self>, stream_id: &str) -> Option<Arc<Relay>> {
        if let Some(existing) = self.get_relay(stream_id) {
            if !existing.is_closed() {
                return Some(existing);
            }
        }

        let mut relay_url = String::new();
        let mut only_source = false;

        if let Some(registry) = &self.publish_registry {
            match registry.get_publishing_server(stream_id).await {
                Ok(Some(url)) => {
                    if !self.config.external_url.is_empty() && url == self.config.external_url {
                        tracing::debug!(
                            stream = stream_id,
                            "Publish registry points at this node; skipping self-relay"
                        );
                    } else {
                        relay_url = url;
                        only_source = true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        stream = stream_id,
                        error = %e,
                        "Could not find publishing server for stream"
                    );
                }
            }
        }

        if relay_url.is_empty() && self.config.relay_from_enabled {
            relay_url = self.config.relay_from_url.clone();
        }

        if relay_url.is_empty() {
            return None;
        }

        Some(self.get_relay_or_create(stream_id, &relay_url, only_source))
    }
}
