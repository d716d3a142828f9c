//! Loki push API client.
//!
//! Builds the JSON push body from a batch of entries and POSTs it to
//! `<base>/loki/api/v1/push`. The response is classified into the three
//! delivery outcomes the dispatcher cares about: success (any 2xx), an
//! HTTP error carrying status and body, or a transport failure.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::error;

use crate::buffer::Entry;
use crate::config::ConfigError;

/// Outcome of a failed push.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Loki answered with a non-2xx status.
    #[error("Loki returned HTTP {status}: {body}")]
    Http {
        /// Response status code.
        status: StatusCode,
        /// Response body, for operator diagnostics.
        body: String,
    },
    /// The request never produced an HTTP response (DNS, connect, read,
    /// timeout).
    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// HTTP client bound to one Loki push endpoint.
#[derive(Clone, Debug)]
pub struct LokiClient {
    client: reqwest::Client,
    push_url: reqwest::Url,
    request_timeout: Duration,
}

impl LokiClient {
    /// Creates a client for the given base URL. The push path is appended
    /// here; `request_timeout` bounds every request.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ConfigError> {
        let push_url = push_url(base_url)?;
        let client = match reqwest::Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(270)))
            .tcp_keepalive(Some(Duration::from_secs(120)))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "failed to build HTTP client, using defaults");
                reqwest::Client::new()
            }
        };
        Ok(LokiClient {
            client,
            push_url,
            request_timeout,
        })
    }

    /// Pushes a batch of entries. An empty batch succeeds without
    /// touching the network.
    pub async fn push(&self, entries: &[Entry]) -> Result<(), DeliveryError> {
        if entries.is_empty() {
            return Ok(());
        }
        let body = build_push_body(entries);
        let response = self
            .client
            .post(self.push_url.clone())
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Http { status, body })
    }
}

fn push_url(base_url: &str) -> Result<reqwest::Url, ConfigError> {
    let full = format!("{}/loki/api/v1/push", base_url.trim_end_matches('/'));
    reqwest::Url::parse(&full).map_err(|e| ConfigError::InvalidField {
        field: "loki_url".to_owned(),
        reason: e.to_string(),
    })
}

/// `{"streams": [...]}` wrapper of the push body.
#[derive(Debug, Serialize)]
pub(crate) struct PushRequest {
    streams: Vec<Stream>,
}

/// One Loki stream: a label set plus its timestamp-sorted values.
#[derive(Debug, Serialize)]
struct Stream {
    stream: BTreeMap<String, String>,
    values: Vec<StreamValue>,
}

/// A single log line: `["<ts>", "<line>"]`, with a trailing structured
/// metadata object iff the entry carries any.
#[derive(Debug)]
struct StreamValue {
    timestamp: String,
    line: String,
    structured_metadata: Option<BTreeMap<String, String>>,
}

impl Serialize for StreamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.structured_metadata.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.timestamp)?;
        seq.serialize_element(&self.line)?;
        if let Some(metadata) = &self.structured_metadata {
            seq.serialize_element(metadata)?;
        }
        seq.end()
    }
}

/// Partitions entries by their exact label mapping and sorts each
/// partition by timestamp ascending (stable, so equal timestamps keep
/// their buffer order). Streams are emitted in label-map order, which
/// makes bodies deterministic.
pub(crate) fn build_push_body(entries: &[Entry]) -> PushRequest {
    let mut partitions: BTreeMap<&BTreeMap<String, String>, Vec<&Entry>> = BTreeMap::new();
    for entry in entries {
        partitions.entry(&entry.labels).or_default().push(entry);
    }

    let streams = partitions
        .into_iter()
        .map(|(labels, mut group)| {
            group.sort_by_key(|entry| entry.timestamp_ns);
            Stream {
                stream: labels.clone(),
                values: group
                    .into_iter()
                    .map(|entry| StreamValue {
                        timestamp: entry.timestamp_ns.to_string(),
                        line: entry.message.clone(),
                        structured_metadata: if entry.structured_metadata.is_empty() {
                            None
                        } else {
                            Some(entry.structured_metadata.clone())
                        },
                    })
                    .collect(),
            }
        })
        .collect();

    PushRequest { streams }
}
