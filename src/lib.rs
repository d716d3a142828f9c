//! # loki-shipper
//!
//! A buffered log-shipping agent for Grafana Loki. Events from a host
//! logging facade are formatted into entries, held in an ordered bounded
//! buffer (persistent or in-memory), and delivered to Loki's JSON push
//! API in batches, with exponential backoff while the endpoint is down
//! and graceful degradation (bounded buffering, oldest-first drops) while
//! it stays down.
//!
//! ## Architecture
//!
//! ```text
//!   producers ──► HandlerInstance ──► Buffer ──► Dispatcher ──► LokiClient ──► Loki
//!                                        ▲            │
//!                                        └── delete ──┘  (after successful push)
//! ```
//!
//! Each handler instance is an independently-configured pairing of one
//! buffer and one dispatcher under a unique id, owned by the
//! [`HandlerRegistry`]. Producers call [`HandlerInstance::store`], which
//! never blocks and never fails from the caller's perspective; the
//! dispatcher periodically claims the smallest-keyed prefix of the
//! buffer, pushes it, and deletes it only after Loki acknowledged,
//! giving at-least-once delivery.
//!
//! ## Modules
//!
//! - [`event`]: the event schema consumed from the logging facade
//! - [`formatter`]: event → entry mapping (labels, structured metadata)
//! - [`config`]: per-handler configuration and validation
//! - [`buffer`]: ordered bounded queue with disk and memory backends
//! - [`client`]: Loki push API client
//! - [`dispatcher`]: timer-driven batching with exponential backoff
//! - [`handler`]: handler lifecycle and registry
//! - [`logger`]: the agent's own diagnostics (a non-Loki sink)
//!
//! ## Example
//!
//! ```no_run
//! use loki_shipper::{Event, HandlerConfig, HandlerRegistry, Level};
//!
//! # async fn run() -> Result<(), loki_shipper::HandlerError> {
//! let registry = HandlerRegistry::new();
//! registry
//!     .attach("app", HandlerConfig::new("http://localhost:3100"))
//!     .await?;
//!
//! let handler = registry.handler("app").await.expect("just attached");
//! handler.store(Event::new(Level::Info, "service started"));
//!
//! registry.flush("app").await?;
//! registry.detach("app").await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

/// Ordered bounded buffering with persistent and volatile backends.
pub mod buffer;

/// Loki push API client.
pub mod client;

/// Per-handler configuration.
pub mod config;

/// Timer-driven batch dispatch with exponential backoff.
pub mod dispatcher;

/// Event schema consumed from the host logging facade.
pub mod event;

/// Event-to-entry formatting.
pub mod formatter;

/// Handler lifecycle and registry.
pub mod handler;

/// Diagnostics formatting for the agent's own logs.
pub mod logger;

pub use buffer::{BufferError, BufferKey, BufferStats, Entry};
pub use client::DeliveryError;
pub use config::{ConfigError, HandlerConfig, LabelSource, Storage};
pub use dispatcher::{DispatcherParams, DispatcherState};
pub use event::{Event, Level, Message};
pub use formatter::format_event;
pub use handler::{HandlerError, HandlerInstance, HandlerRegistry};
