//! Source registry
//!
//! Maps stream IDs to the currently authoritative source with
//! one-publisher-wins semantics: creating a source for an ID that is
//! already live displaces (closes) the previous one. While a source is
//! open, a per-source task announces `(stream_id -> this node's URL)` into
//! the publish registry so other nodes can discover it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::source::Source;
use crate::discovery::PublishRegistry;
use crate::limits::MemoryLimiter;

/// Source registry configuration
#[derive(Debug, Clone)]
pub struct SourceRegistryConfig {
    /// Ring capacity for new sources
    pub fragment_buffer_max_length: usize,

    /// URL other nodes can reach this node at; empty disables announcing
    pub external_url: String,
}

impl Default for SourceRegistryConfig {
    fn default() -> Self {
        Self {
            fragment_buffer_max_length: crate::protocol::DEFAULT_FRAGMENT_BUFFER_MAX_LENGTH,
            external_url: String::new(),
        }
    }
}

/// Registry of the live sources on this node
pub struct SourceRegistry {
    config: SourceRegistryConfig,
    memory_limiter: Arc<MemoryLimiter>,
    publish_registry: Option<Arc<dyn PublishRegistry>>,
    sources: Mutex<HashMap<String, Arc<Source>>>,
}

impl SourceRegistry {
    /// Create a new source registry
    pub fn new(
        config: SourceRegistryConfig,
        memory_limiter: Arc<MemoryLimiter>,
        publish_registry: Option<Arc<dyn PublishRegistry>>,
    ) -> Self {
        Self {
            config,
            memory_limiter,
            publish_registry,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Get the current source for a stream, if any
    pub fn get_source(&self, stream_id: &str) -> Option<Arc<Source>> {
        self.sources.lock().unwrap().get(stream_id).cloned()
    }

    /// Number of live sources
    pub fn source_count(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    /// Install a fresh source for a stream, displacing any prior one
    ///
    /// The swap happens under the registry lock so concurrent pulls see
    /// either the old source or the new one, never neither; the displaced
    /// source is closed after the lock is released.
    pub fn create_source(&self, stream_id: &str) -> Arc<Source> {
        let source = Arc::new(Source::new(
            stream_id,
            self.config.fragment_buffer_max_length,
            self.memory_limiter.clone(),
        ));

        let displaced = {
            let mut sources = self.sources.lock().unwrap();
            sources.insert(stream_id.to_string(), source.clone())
        };

        if let Some(old) = displaced {
            tracing::info!(stream = stream_id, "Displacing previous publisher");
            old.close();
        }

        self.spawn_announce_task(&source);

        source
    }

    /// Remove a source, but only if it is still the registered one
    ///
    /// Guards against a publisher tearing down a successor that displaced
    /// it in the meantime.
    pub fn remove_source(&self, stream_id: &str, source: &Arc<Source>) {
        let mut sources = self.sources.lock().unwrap();

        if let Some(existing) = sources.get(stream_id) {
            if Arc::ptr_eq(existing, source) {
                sources.remove(stream_id);
            }
        }
    }

    /// Spawn the periodic announce task for a new source
    ///
    /// The first announce fires immediately, then every announce interval
    /// until the source closes. Without a publish registry or an external
    /// URL there is nothing to announce.
    fn spawn_announce_task(&self, source: &Arc<Source>) {
        let registry = match &self.publish_registry {
            Some(registry) => registry.clone(),
            None => return,
        };

        if self.config.external_url.is_empty() {
            return;
        }

        let stream_id = source.stream_id().to_string();
        let url = self.config.external_url.clone();
        let mut closed = source.closed_watch();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.announce_interval());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.announce(&stream_id, &url).await {
                            tracing::warn!(
                                stream = %stream_id,
                                error = %e,
                                "Could not announce stream to the publish registry"
                            );
                        }
                    }
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
