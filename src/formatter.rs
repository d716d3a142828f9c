//! Maps facade events to buffer entries.
//!
//! One pure function, [`format_event`], applies the handler's label plan
//! and structured-metadata selection to an [`Event`] and renders its
//! message. It never fails: unusable label sources are omitted, and an
//! event whose extraction yields no labels at all gets the default
//! `{level: <level>}` label, because a Loki stream requires at least one.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::debug;

use crate::buffer::Entry;
use crate::config::LabelSource;
use crate::event::{Event, Message};

/// Builds the buffered entry for an event.
///
/// Rules:
/// - timestamp: the `time` metadata key (microseconds since epoch)
///   multiplied to nanoseconds, else the current wall clock;
/// - labels: each configured source is resolved against the event;
///   missing or null metadata omits the label;
/// - structured metadata: a requested key is included iff the event
///   metadata holds a non-null value for it;
/// - message: see [`Message`] rendering below.
#[must_use]
pub fn format_event(
    event: &Event,
    label_config: &BTreeMap<String, LabelSource>,
    structured_metadata_keys: &[String],
) -> Entry {
    let mut labels = BTreeMap::new();
    for (name, source) in label_config {
        match source {
            LabelSource::FromLevel => {
                labels.insert(name.clone(), event.level.as_str().to_owned());
            }
            LabelSource::FromMetadata(key) => match event.meta.get(key) {
                Some(value) if !value.is_null() => {
                    labels.insert(name.clone(), coerce_to_string(value));
                }
                _ => {}
            },
            LabelSource::Static(value) => {
                labels.insert(name.clone(), value.clone());
            }
        }
    }
    if labels.is_empty() {
        debug!("no labels extracted, falling back to the level label");
        labels.insert("level".to_owned(), event.level.as_str().to_owned());
    }

    let mut structured_metadata = BTreeMap::new();
    for key in structured_metadata_keys {
        if let Some(value) = event.meta.get(key) {
            if !value.is_null() {
                structured_metadata.insert(key.clone(), coerce_to_string(value));
            }
        }
    }

    Entry {
        timestamp_ns: event_timestamp_ns(event),
        level: event.level,
        message: render_message(event),
        labels,
        structured_metadata,
    }
}

/// Event timestamp in nanoseconds: `time` metadata (microseconds) when
/// present, the wall clock otherwise.
fn event_timestamp_ns(event: &Event) -> i64 {
    if let Some(micros) = event.meta.get("time").and_then(Value::as_i64) {
        return micros.saturating_mul(1_000);
    }
    wall_clock_ns()
}

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Coerces a metadata value to a label / structured-metadata string:
/// strings pass through, numbers and booleans use their display form,
/// anything else its JSON rendering.
fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn render_message(event: &Event) -> String {
    match &event.msg {
        Message::Text(text) => text.clone(),
        Message::Format(template, args) => render_format(template, args),
        Message::Report(pairs) => match &event.report_callback {
            Some(callback) => callback(pairs),
            None => pairs
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(" "),
        },
    }
}

/// Printf-style rendering: `%s`, `%d` and `%f` consume the next argument
/// coerced to a string, `%%` emits a literal percent, and anything else
/// (including directives with no argument left) stays literal.
fn render_format(template: &str, args: &[Value]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut next_arg = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                output.push('%');
            }
            Some(directive @ ('s' | 'd' | 'f')) => {
                match next_arg.next() {
                    Some(value) => {
                        chars.next();
                        output.push_str(&coerce_to_string(value));
                    }
                    None => {
                        chars.next();
                        output.push('%');
                        output.push(directive);
                    }
                }
            }
            _ => output.push('%'),
        }
    }
    output
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Level;
    use serde_json::json;
    use std::sync::Arc;

    fn labels(pairs: &[(&str, LabelSource)]) -> BTreeMap<String, LabelSource> {
        pairs
            .iter()
            .map(|(name, source)| ((*name).to_owned(), source.clone()))
            .collect()
    }

    fn default_labels() -> BTreeMap<String, LabelSource> {
        labels(&[("level", LabelSource::FromLevel)])
    }

    #[test]
    fn metadata_time_is_scaled_to_nanoseconds() {
        let event = Event::new(Level::Info, "x").with_time_us(1_700_000_000_000_000);
        let entry = format_event(&event, &default_labels(), &[]);
        assert_eq!(entry.timestamp_ns, 1_700_000_000_000_000_000);
    }

    #[test]
    fn missing_time_uses_wall_clock() {
        let before = wall_clock_ns();
        let entry = format_event(&Event::new(Level::Info, "x"), &default_labels(), &[]);
        let after = wall_clock_ns();
        assert!(entry.timestamp_ns >= before && entry.timestamp_ns <= after);
    }

    #[test]
    fn labels_resolve_per_source() {
        let event = Event::new(Level::Warning, "x").with_meta("host", "web-1");
        let config = labels(&[
            ("level", LabelSource::FromLevel),
            ("host", LabelSource::FromMetadata("host".to_owned())),
            ("app", LabelSource::Static("api".to_owned())),
        ]);

        let entry = format_event(&event, &config, &[]);
        assert_eq!(entry.labels["level"], "warning");
        assert_eq!(entry.labels["host"], "web-1");
        assert_eq!(entry.labels["app"], "api");
    }

    #[test]
    fn missing_or_null_metadata_omits_the_label() {
        let event = Event::new(Level::Info, "x").with_meta("gone", Value::Null);
        let config = labels(&[
            ("level", LabelSource::FromLevel),
            ("absent", LabelSource::FromMetadata("absent".to_owned())),
            ("gone", LabelSource::FromMetadata("gone".to_owned())),
        ]);

        let entry = format_event(&event, &config, &[]);
        assert_eq!(entry.labels.len(), 1);
        assert!(entry.labels.contains_key("level"));
    }

    #[test]
    fn empty_extraction_falls_back_to_level_label() {
        let event = Event::new(Level::Error, "x");
        let config = labels(&[("host", LabelSource::FromMetadata("host".to_owned()))]);

        let entry = format_event(&event, &config, &[]);
        assert_eq!(
            entry.labels,
            BTreeMap::from([("level".to_owned(), "error".to_owned())])
        );
    }

    #[test]
    fn structured_metadata_included_iff_present_and_non_null() {
        let event = Event::new(Level::Info, "x")
            .with_meta("request_id", "r1")
            .with_meta("attempt", 3)
            .with_meta("user", Value::Null);

        let keys = vec![
            "request_id".to_owned(),
            "attempt".to_owned(),
            "user".to_owned(),
            "absent".to_owned(),
        ];
        let entry = format_event(&event, &default_labels(), &keys);

        assert_eq!(
            entry.structured_metadata,
            BTreeMap::from([
                ("request_id".to_owned(), "r1".to_owned()),
                ("attempt".to_owned(), "3".to_owned()),
            ])
        );
    }

    #[test]
    fn coercion_covers_value_shapes() {
        assert_eq!(coerce_to_string(&json!("text")), "text");
        assert_eq!(coerce_to_string(&json!(42)), "42");
        assert_eq!(coerce_to_string(&json!(2.5)), "2.5");
        assert_eq!(coerce_to_string(&json!(true)), "true");
        assert_eq!(coerce_to_string(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(coerce_to_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn text_message_passes_through() {
        let entry = format_event(&Event::new(Level::Info, "hello"), &default_labels(), &[]);
        assert_eq!(entry.message, "hello");
    }

    #[test]
    fn format_message_applies_printf_directives() {
        let event = Event {
            level: Level::Info,
            msg: Message::Format(
                "user %s retried %d times (%f%%)".to_owned(),
                vec![json!("ada"), json!(3), json!(1.5)],
            ),
            meta: Default::default(),
            report_callback: None,
        };
        let entry = format_event(&event, &default_labels(), &[]);
        assert_eq!(entry.message, "user ada retried 3 times (1.5%)");
    }

    #[test]
    fn format_message_leaves_unmatched_directives() {
        let event = Event {
            level: Level::Info,
            msg: Message::Format("%s and %s".to_owned(), vec![json!("one")]),
            meta: Default::default(),
            report_callback: None,
        };
        let entry = format_event(&event, &default_labels(), &[]);
        assert_eq!(entry.message, "one and %s");
    }

    #[test]
    fn report_message_renders_key_value_pairs() {
        let event = Event {
            level: Level::Info,
            msg: Message::Report(vec![
                ("action".to_owned(), json!("login")),
                ("attempt".to_owned(), json!(2)),
            ]),
            meta: Default::default(),
            report_callback: None,
        };
        let entry = format_event(&event, &default_labels(), &[]);
        assert_eq!(entry.message, r#"action="login" attempt=2"#);
    }

    #[test]
    fn report_callback_overrides_default_rendering() {
        let event = Event {
            level: Level::Info,
            msg: Message::Report(vec![("k".to_owned(), json!("v"))]),
            meta: Default::default(),
            report_callback: Some(Arc::new(|pairs| format!("custom: {} pair(s)", pairs.len()))),
        };
        let entry = format_event(&event, &default_labels(), &[]);
        assert_eq!(entry.message, "custom: 1 pair(s)");
    }
}
