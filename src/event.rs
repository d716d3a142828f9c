//! Event schema consumed from the host logging facade.
//!
//! The agent does not own the logging facade; it accepts [`Event`] values
//! from it and turns them into buffered entries (see [`crate::formatter`]).
//! Metadata values are arbitrary JSON terms because the facade places no
//! schema on them; well-known keys (`time` in microseconds since epoch)
//! are interpreted by the formatter.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a log event.
///
/// The eight syslog-style severities, ordered from least to most severe.
/// Serialized lowercase so it can appear directly as a Loki label value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    /// Lowercase name of the level, as used for the default `level` label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Alert => "alert",
            Level::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "notice" => Ok(Level::Notice),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" => Ok(Level::Critical),
            "alert" => Ok(Level::Alert),
            "emergency" => Ok(Level::Emergency),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Message payload of an event.
///
/// The facade delivers one of three shapes: already-rendered text, a
/// printf-style template with arguments, or a report of key/value pairs.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Rendered text, passed through unchanged.
    Text(String),
    /// Printf-style template plus arguments, rendered by the formatter.
    Format(String, Vec<Value>),
    /// Key/value report, rendered as `k=v` pairs unless the event carries
    /// a report callback.
    Report(Vec<(String, Value)>),
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::Text(value.to_owned())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::Text(value)
    }
}

/// Callback supplied by the facade to render a report message.
pub type ReportCallback = Arc<dyn Fn(&[(String, Value)]) -> String + Send + Sync>;

/// A log event as delivered by the host logging facade.
#[derive(Clone)]
pub struct Event {
    /// Severity of the event.
    pub level: Level,
    /// Message payload.
    pub msg: Message,
    /// Event metadata. The well-known `time` key carries microseconds
    /// since epoch as a JSON number; user keys are referenced by label
    /// and structured-metadata configuration.
    pub meta: HashMap<String, Value>,
    /// Optional renderer for [`Message::Report`] payloads.
    pub report_callback: Option<ReportCallback>,
}

impl Event {
    /// Creates an event with empty metadata.
    #[must_use]
    pub fn new(level: Level, msg: impl Into<Message>) -> Self {
        Event {
            level,
            msg: msg.into(),
            meta: HashMap::new(),
            report_callback: None,
        }
    }

    /// Adds a metadata key/value pair.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Sets the event timestamp, in microseconds since epoch.
    #[must_use]
    pub fn with_time_us(self, micros: i64) -> Self {
        self.with_meta("time", micros)
    }

    /// Sets the report renderer used for [`Message::Report`] payloads.
    #[must_use]
    pub fn with_report_callback(mut self, callback: ReportCallback) -> Self {
        self.report_callback = Some(callback);
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("level", &self.level)
            .field("msg", &self.msg)
            .field("meta", &self.meta)
            .field(
                "report_callback",
                &self.report_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trips_through_serde() {
        let level: Level = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(level, Level::Warning);
        assert_eq!(serde_json::to_string(&Level::Emergency).unwrap(), "\"emergency\"");
    }

    #[test]
    fn level_parses_case_insensitively() {
        assert_eq!(Level::from_str("INFO").unwrap(), Level::Info);
        assert_eq!(Level::from_str("warn").unwrap(), Level::Warning);
        assert!(Level::from_str("loud").is_err());
    }

    #[test]
    fn event_builder_collects_metadata() {
        let event = Event::new(Level::Info, "hello")
            .with_time_us(1_700_000_000_000_000)
            .with_meta("request_id", "r1");

        assert_eq!(event.level, Level::Info);
        assert_eq!(event.msg, Message::Text("hello".to_owned()));
        assert_eq!(event.meta["time"], Value::from(1_700_000_000_000_000_i64));
        assert_eq!(event.meta["request_id"], Value::from("r1"));
    }

    #[test]
    fn event_debug_hides_callback_body() {
        let event = Event::new(Level::Debug, "x")
            .with_report_callback(Arc::new(|_| String::from("rendered")));
        let debug = format!("{event:?}");
        assert!(debug.contains("<callback>"));
    }
}
