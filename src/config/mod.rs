//! Per-handler configuration.
//!
//! Each handler instance carries its own [`HandlerConfig`]. Configuration
//! arrives programmatically (from the host application or facade glue) and
//! is validated before any side effect happens. Defaults follow the table
//! in the crate docs; every field except `loki_url` has one.
//!
//! Two fields are bound to live resources once a handler is attached:
//! `storage` selects the buffer backend and `data_dir` the on-disk
//! location. Changing either on a running handler is rejected (see
//! [`ConfigError::ImmutableField`]).

pub mod label_source;

pub use label_source::LabelSource;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Buffer backend selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// Persistent backend; buffered entries survive restarts.
    #[default]
    Disk,
    /// Volatile in-process backend; faster, nothing survives a restart.
    Memory,
}

/// Errors surfaced by configuration validation and reconfiguration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is absent or empty.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// A field is present but its value is unusable.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// The field is bound to a live resource and cannot change on a
    /// running handler.
    #[error("field `{0}` cannot be changed on a running handler")]
    ImmutableField(&'static str),
}

/// Public configuration of a handler instance.
///
/// All fields other than `loki_url` default as documented on each field.
/// The struct round-trips through serde, which is also how partial
/// updates are merged (see [`HandlerConfig::merged_with`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Base URL of the Loki instance; `/loki/api/v1/push` is appended.
    pub loki_url: String,

    /// Buffer backend. Defaults to [`Storage::Disk`].
    #[serde(default)]
    pub storage: Storage,

    /// Label extraction plan. Defaults to `{level: from level}`.
    #[serde(default = "default_labels")]
    pub labels: BTreeMap<String, LabelSource>,

    /// Metadata keys emitted as Loki structured metadata when present.
    #[serde(default)]
    pub structured_metadata: Vec<String>,

    /// Directory for the persistent backend. Defaults to
    /// `priv/loki_buffer/<handler id>` when unset.
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Maximum entries per push. Default 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Dispatch timer interval in milliseconds. Default 5000.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Buffered-entry ceiling before overflow eviction. Default 10000.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Base retry delay after a failed push, in milliseconds. Default 1000.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling in milliseconds. Default 60000.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_labels() -> BTreeMap<String, LabelSource> {
    BTreeMap::from([("level".to_owned(), LabelSource::FromLevel)])
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_interval_ms() -> u64 {
    5_000
}

fn default_max_buffer_size() -> usize {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

impl HandlerConfig {
    /// Creates a configuration with the given Loki base URL and defaults
    /// for everything else.
    #[must_use]
    pub fn new(loki_url: impl Into<String>) -> Self {
        HandlerConfig {
            loki_url: loki_url.into(),
            storage: Storage::default(),
            labels: default_labels(),
            structured_metadata: Vec::new(),
            data_dir: None,
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            max_buffer_size: default_max_buffer_size(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }

    /// Checks every field for usability. No side effects.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loki_url.trim().is_empty() {
            return Err(ConfigError::MissingField("loki_url"));
        }
        if let Err(e) = reqwest::Url::parse(&self.loki_url) {
            return Err(ConfigError::InvalidField {
                field: "loki_url".to_owned(),
                reason: e.to_string(),
            });
        }
        Self::require_positive("batch_size", self.batch_size as u64)?;
        Self::require_positive("batch_interval_ms", self.batch_interval_ms)?;
        Self::require_positive("max_buffer_size", self.max_buffer_size as u64)?;
        Self::require_positive("backoff_base_ms", self.backoff_base_ms)?;
        Self::require_positive("backoff_max_ms", self.backoff_max_ms)?;
        Ok(())
    }

    fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidField {
                field: field.to_owned(),
                reason: "must be a positive integer".to_owned(),
            });
        }
        Ok(())
    }

    /// Deep-merges a JSON partial into this configuration and validates
    /// the result. Object values merge key-by-key; everything else
    /// replaces the current value.
    pub fn merged_with(&self, partial: &Value) -> Result<HandlerConfig, ConfigError> {
        if !partial.is_object() {
            return Err(ConfigError::InvalidField {
                field: "<config>".to_owned(),
                reason: "partial config must be a JSON object".to_owned(),
            });
        }
        let mut current = serde_json::to_value(self).map_err(|e| ConfigError::InvalidField {
            field: "<config>".to_owned(),
            reason: e.to_string(),
        })?;
        deep_merge(&mut current, partial);
        let merged: HandlerConfig =
            serde_json::from_value(current).map_err(|e| ConfigError::InvalidField {
                field: "<config>".to_owned(),
                reason: e.to_string(),
            })?;
        merged.validate()?;
        Ok(merged)
    }

    /// Returns the first storage-bound field that differs between this
    /// (running) configuration and a proposed one.
    #[must_use]
    pub fn immutable_change(&self, proposed: &HandlerConfig) -> Option<&'static str> {
        if self.storage != proposed.storage {
            return Some("storage");
        }
        if self.data_dir != proposed.data_dir {
            return Some("data_dir");
        }
        None
    }

    /// The persistent backend directory for a handler with the given id.
    #[must_use]
    pub fn resolve_data_dir(&self, id: &str) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from("priv/loki_buffer").join(id),
        }
    }
}

/// Recursively merges `patch` into `base`. Objects merge per key; any
/// other value in `patch` replaces the corresponding `base` value.
fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
