//! Handler instances and their registry.
//!
//! A [`HandlerInstance`] binds one buffer and one dispatcher under a
//! unique id; the [`HandlerRegistry`] owns all instances and serializes
//! attach/detach. Ownership is explicit: dropping an instance from the
//! registry tears the pair down in order (dispatcher first, then buffer),
//! so no component outlives its peer.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::buffer::{
    BufferBackend, BufferError, BufferHandle, BufferService, BufferStats, DiskBuffer,
    KeyGenerator, MemoryBuffer,
};
use crate::client::{DeliveryError, LokiClient};
use crate::config::{ConfigError, HandlerConfig, Storage};
use crate::dispatcher::{DispatcherHandle, DispatcherParams, DispatcherService, DispatcherState};
use crate::event::Event;
use crate::formatter::format_event;

/// How long detach waits for the dispatcher (including an in-flight
/// push) before abandoning it.
const DETACH_GRACE: Duration = Duration::from_secs(5);

/// Errors surfaced by handler lifecycle and registry operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The id is not registered.
    #[error("no handler registered under id `{0}`")]
    UnknownHandler(String),
    /// The id is already registered; detach it first.
    #[error("handler `{0}` is already attached")]
    AlreadyAttached(String),
    /// Configuration was rejected; nothing was started or changed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A component failed to start; partial starts were rolled back.
    #[error("failed to start {component}: {source}")]
    StartFailed {
        /// Which component failed.
        component: &'static str,
        /// Underlying cause.
        #[source]
        source: BufferError,
    },
    /// A push attempt failed; the buffer was left untouched.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// One attached handler: a buffer/dispatcher pair plus its mutable
/// public configuration.
pub struct HandlerInstance {
    id: String,
    config: RwLock<HandlerConfig>,
    buffer: BufferHandle,
    dispatcher: DispatcherHandle,
}

impl HandlerInstance {
    async fn start(id: &str, config: HandlerConfig) -> Result<Self, HandlerError> {
        config.validate()?;

        let (backend, keys): (Box<dyn BufferBackend>, KeyGenerator) = match config.storage {
            Storage::Disk => {
                let dir = config.resolve_data_dir(id);
                let disk = DiskBuffer::open(&dir).map_err(|e| HandlerError::StartFailed {
                    component: "buffer",
                    source: e,
                })?;
                // Floor new keys above everything persisted so entries
                // stored before a restart keep draining first.
                let floor = disk
                    .last_key()
                    .map_err(|e| HandlerError::StartFailed {
                        component: "buffer",
                        source: e,
                    })?
                    .map_or(0, |key| key.monotonic_ns);
                (Box::new(disk), KeyGenerator::with_floor(floor))
            }
            Storage::Memory => (Box::new(MemoryBuffer::new()), KeyGenerator::new()),
        };

        let buffer = BufferService::spawn(backend, keys, config.max_buffer_size);

        let params = DispatcherParams::from_config(&config);
        let client = match LokiClient::new(&config.loki_url, params.request_timeout()) {
            Ok(client) => client,
            Err(e) => {
                // Roll the buffer back; the pair starts together or not
                // at all.
                let _ = buffer.shutdown().await;
                return Err(HandlerError::Config(e));
            }
        };
        let dispatcher = DispatcherService::spawn(buffer.clone(), client, params);

        Ok(HandlerInstance {
            id: id.to_owned(),
            config: RwLock::new(config),
            buffer,
            dispatcher,
        })
    }

    /// The handler's unique id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Formats and buffers an event. Non-blocking, fire-and-forget:
    /// failures are logged to the agent's own sink, never returned.
    pub fn store(&self, event: Event) {
        let entry = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            format_event(&event, &config.labels, &config.structured_metadata)
        };
        self.buffer.store(entry);
    }

    /// Pushes the buffered backlog once, blocking until the attempt
    /// resolves. The dispatch timer is unaffected.
    pub async fn flush(&self) -> Result<(), HandlerError> {
        match self.dispatcher.flush().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HandlerError::Delivery(e)),
            Err(_) => Err(HandlerError::UnknownHandler(self.id.clone())),
        }
    }

    /// The public configuration. Internal bindings (resolved paths,
    /// service handles) are not part of it.
    #[must_use]
    pub fn get_config(&self) -> HandlerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the public configuration wholesale. The storage binding
    /// is preserved: incoming `storage`/`data_dir` values are overridden
    /// with the attached ones.
    pub async fn set_config(&self, mut new: HandlerConfig) -> Result<(), HandlerError> {
        new.validate()?;
        {
            let current = self.config.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(field) = current.immutable_change(&new) {
                warn!(id = %self.id, field, "ignoring change to storage-bound field");
            }
            new.storage = current.storage;
            new.data_dir = current.data_dir.clone();
        }
        self.apply_config(new).await
    }

    /// Deep-merges a JSON partial into the current configuration.
    /// Changes to `storage` or `data_dir` are rejected.
    pub async fn update_config(&self, partial: &Value) -> Result<(), HandlerError> {
        let merged = {
            let current = self.config.read().unwrap_or_else(PoisonError::into_inner);
            let merged = current.merged_with(partial)?;
            if let Some(field) = current.immutable_change(&merged) {
                return Err(ConfigError::ImmutableField(field).into());
            }
            merged
        };
        self.apply_config(merged).await
    }

    /// Current dispatcher state (failure counter, next interval).
    pub async fn dispatcher_state(&self) -> Result<DispatcherState, HandlerError> {
        self.dispatcher
            .get_state()
            .await
            .map_err(|_| HandlerError::UnknownHandler(self.id.clone()))
    }

    /// Buffer traffic counters.
    pub async fn stats(&self) -> Result<BufferStats, HandlerError> {
        self.buffer
            .stats()
            .await
            .map_err(|_| HandlerError::UnknownHandler(self.id.clone()))
    }

    /// Current number of buffered entries.
    pub async fn buffered(&self) -> Result<usize, HandlerError> {
        self.buffer
            .count()
            .await
            .map_err(|_| HandlerError::UnknownHandler(self.id.clone()))
    }

    async fn apply_config(&self, new: HandlerConfig) -> Result<(), HandlerError> {
        let params = DispatcherParams::from_config(&new);
        let client = LokiClient::new(&new.loki_url, params.request_timeout())?;

        self.buffer.set_max_size(new.max_buffer_size);
        self.dispatcher
            .reconfigure(params, client)
            .await
            .map_err(|_| HandlerError::UnknownHandler(self.id.clone()))?;

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new;
        Ok(())
    }

    /// Stops the pair: dispatcher first (waiting out an in-flight push up
    /// to the grace period), then the buffer backend. Idempotent.
    async fn shutdown(&self) {
        self.dispatcher.shutdown(DETACH_GRACE).await;
        if let Err(e) = self.buffer.shutdown().await {
            error!(id = %self.id, error = %e, "failed to close buffer");
        }
    }
}

/// Process-wide registry of handler instances.
///
/// Created once at startup by the embedding application and torn down at
/// shutdown; attach/detach are serialized through the registry lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Arc<HandlerInstance>>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Validates the configuration, starts a buffer/dispatcher pair and
    /// registers it under `id`.
    pub async fn attach(&self, id: &str, config: HandlerConfig) -> Result<(), HandlerError> {
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(id) {
            return Err(HandlerError::AlreadyAttached(id.to_owned()));
        }
        let instance = HandlerInstance::start(id, config).await?;
        handlers.insert(id.to_owned(), Arc::new(instance));
        info!(id, "handler attached");
        Ok(())
    }

    /// Stops and removes the handler. The registry lock is held across
    /// the teardown so the id only becomes reusable once its resources
    /// (including a disk buffer's lock) are released.
    pub async fn detach(&self, id: &str) -> Result<(), HandlerError> {
        let mut handlers = self.handlers.lock().await;
        let instance = handlers
            .remove(id)
            .ok_or_else(|| HandlerError::UnknownHandler(id.to_owned()))?;
        instance.shutdown().await;
        info!(id, "handler detached");
        Ok(())
    }

    /// The instance registered under `id`, for producers that want to
    /// call [`HandlerInstance::store`] without re-locking the registry.
    pub async fn handler(&self, id: &str) -> Option<Arc<HandlerInstance>> {
        self.handlers.lock().await.get(id).cloned()
    }

    /// Formats and buffers an event on the given handler.
    pub async fn store(&self, id: &str, event: Event) -> Result<(), HandlerError> {
        self.get(id).await?.store(event);
        Ok(())
    }

    /// Flushes the handler's backlog once, returning the delivery outcome.
    pub async fn flush(&self, id: &str) -> Result<(), HandlerError> {
        self.get(id).await?.flush().await
    }

    /// Public configuration of the handler.
    pub async fn get_config(&self, id: &str) -> Result<HandlerConfig, HandlerError> {
        Ok(self.get(id).await?.get_config())
    }

    /// Replaces the handler's public configuration wholesale.
    pub async fn set_config(&self, id: &str, config: HandlerConfig) -> Result<(), HandlerError> {
        self.get(id).await?.set_config(config).await
    }

    /// Deep-merges a JSON partial into the handler's configuration.
    pub async fn update_config(&self, id: &str, partial: &Value) -> Result<(), HandlerError> {
        self.get(id).await?.update_config(partial).await
    }

    /// Buffer traffic counters of the handler.
    pub async fn stats(&self, id: &str) -> Result<BufferStats, HandlerError> {
        self.get(id).await?.stats().await
    }

    /// Ids of all attached handlers, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn get(&self, id: &str) -> Result<Arc<HandlerInstance>, HandlerError> {
        self.handler(id)
            .await
            .ok_or_else(|| HandlerError::UnknownHandler(id.to_owned()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::LabelSource;
    use crate::event::Level;
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_config(url: &str) -> HandlerConfig {
        let mut config = HandlerConfig::new(url);
        config.storage = Storage::Memory;
        config
    }

    #[tokio::test]
    async fn lifecycle_operations_cover_the_registry() {
        let registry = HandlerRegistry::new();
        registry
            .attach("app", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();
        registry
            .attach("jobs", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();

        assert_eq!(registry.list().await, vec!["app", "jobs"]);

        registry.detach("app").await.unwrap();
        assert_eq!(registry.list().await, vec!["jobs"]);

        assert!(matches!(
            registry.detach("app").await,
            Err(HandlerError::UnknownHandler(_))
        ));
        registry.detach("jobs").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_attach_is_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .attach("app", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();
        assert!(matches!(
            registry.attach("app", memory_config("http://127.0.0.1:1")).await,
            Err(HandlerError::AlreadyAttached(_))
        ));
        registry.detach("app").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_attaches_nothing() {
        let registry = HandlerRegistry::new();
        let result = registry.attach("app", memory_config("  ")).await;
        assert!(matches!(
            result,
            Err(HandlerError::Config(ConfigError::MissingField("loki_url")))
        ));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_errors_from_every_operation() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.flush("ghost").await,
            Err(HandlerError::UnknownHandler(_))
        ));
        assert!(matches!(
            registry.get_config("ghost").await,
            Err(HandlerError::UnknownHandler(_))
        ));
        assert!(matches!(
            registry.update_config("ghost", &json!({})).await,
            Err(HandlerError::UnknownHandler(_))
        ));
    }

    #[tokio::test]
    async fn update_config_merges_and_reaches_the_dispatcher() {
        let registry = HandlerRegistry::new();
        registry
            .attach("app", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();

        registry
            .update_config(
                "app",
                &json!({
                    "batch_size": 7,
                    "batch_interval_ms": 250,
                    "labels": {"service": {"static": "api"}}
                }),
            )
            .await
            .unwrap();

        let config = registry.get_config("app").await.unwrap();
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.batch_interval_ms, 250);
        assert_eq!(config.labels["service"], LabelSource::Static("api".to_owned()));
        // defaults untouched by the merge
        assert_eq!(config.max_buffer_size, 10_000);

        let handler = registry.handler("app").await.unwrap();
        let state = handler.dispatcher_state().await.unwrap();
        assert_eq!(state.next_interval, Duration::from_millis(250));

        registry.detach("app").await.unwrap();
    }

    #[tokio::test]
    async fn update_config_rejects_storage_changes() {
        let registry = HandlerRegistry::new();
        registry
            .attach("app", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();

        let result = registry
            .update_config("app", &json!({"storage": "disk"}))
            .await;
        assert!(matches!(
            result,
            Err(HandlerError::Config(ConfigError::ImmutableField("storage")))
        ));

        let result = registry
            .update_config("app", &json!({"data_dir": "/tmp/elsewhere"}))
            .await;
        assert!(matches!(
            result,
            Err(HandlerError::Config(ConfigError::ImmutableField("data_dir")))
        ));

        registry.detach("app").await.unwrap();
    }

    #[tokio::test]
    async fn set_config_preserves_the_storage_binding() {
        let registry = HandlerRegistry::new();
        registry
            .attach("app", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();

        let mut replacement = HandlerConfig::new("http://127.0.0.1:2");
        replacement.storage = Storage::Disk;
        replacement.data_dir = Some("/tmp/should-be-ignored".to_owned());
        replacement.batch_size = 3;
        registry.set_config("app", replacement).await.unwrap();

        let config = registry.get_config("app").await.unwrap();
        assert_eq!(config.loki_url, "http://127.0.0.1:2");
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.storage, Storage::Memory);
        assert_eq!(config.data_dir, None);

        registry.detach("app").await.unwrap();
    }

    #[tokio::test]
    async fn store_counts_into_buffer_stats() {
        let registry = HandlerRegistry::new();
        registry
            .attach("app", memory_config("http://127.0.0.1:1"))
            .await
            .unwrap();

        for i in 0..3 {
            registry
                .store("app", Event::new(Level::Info, format!("m{i}")))
                .await
                .unwrap();
        }

        let handler = registry.handler("app").await.unwrap();
        assert_eq!(handler.buffered().await.unwrap(), 3);
        let stats = registry.stats("app").await.unwrap();
        assert_eq!(stats.stored, 3);
        assert_eq!(stats.dropped, 0);

        registry.detach("app").await.unwrap();
    }

    #[tokio::test]
    async fn disk_handler_attaches_in_a_fresh_directory() {
        let tmp = TempDir::new().unwrap();
        let mut config = HandlerConfig::new("http://127.0.0.1:1");
        config.data_dir = Some(tmp.path().join("buffer").to_string_lossy().into_owned());

        let registry = HandlerRegistry::new();
        registry.attach("disk", config).await.unwrap();
        registry
            .store("disk", Event::new(Level::Info, "persisted"))
            .await
            .unwrap();
        let handler = registry.handler("disk").await.unwrap();
        assert_eq!(handler.buffered().await.unwrap(), 1);
        registry.detach("disk").await.unwrap();
    }
}
