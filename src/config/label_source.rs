//! Source descriptors for Loki label extraction.

use serde::{Deserialize, Serialize};

/// Where a configured label takes its value from.
///
/// # Wire format
///
/// - `"level"`: the event's severity name
/// - `{"metadata": "<key>"}`: the event metadata value at `<key>`;
///   the label is omitted when the key is missing or null
/// - `{"static": "<value>"}`: a fixed string
///
/// ```
/// use loki_shipper::config::LabelSource;
///
/// let source: LabelSource = serde_json::from_str("\"level\"").unwrap();
/// assert_eq!(source, LabelSource::FromLevel);
///
/// let source: LabelSource = serde_json::from_str(r#"{"metadata": "host"}"#).unwrap();
/// assert_eq!(source, LabelSource::FromMetadata("host".to_owned()));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSource {
    /// The event severity, rendered lowercase.
    #[serde(rename = "level")]
    FromLevel,
    /// The event metadata value under the given key.
    #[serde(rename = "metadata")]
    FromMetadata(String),
    /// A fixed value independent of the event.
    #[serde(rename = "static")]
    Static(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_level() {
        let source: LabelSource = serde_json::from_str("\"level\"").unwrap();
        assert_eq!(source, LabelSource::FromLevel);
    }

    #[test]
    fn deserialize_metadata() {
        let source: LabelSource = serde_json::from_str(r#"{"metadata": "service"}"#).unwrap();
        assert_eq!(source, LabelSource::FromMetadata("service".to_owned()));
    }

    #[test]
    fn deserialize_static() {
        let source: LabelSource = serde_json::from_str(r#"{"static": "api"}"#).unwrap();
        assert_eq!(source, LabelSource::Static("api".to_owned()));
    }

    #[test]
    fn serialize_round_trip() {
        for source in [
            LabelSource::FromLevel,
            LabelSource::FromMetadata("k".to_owned()),
            LabelSource::Static("v".to_owned()),
        ] {
            let json = serde_json::to_string(&source).unwrap();
            let back: LabelSource = serde_json::from_str(&json).unwrap();
            assert_eq!(back, source);
        }
    }

    #[test]
    fn deserialize_unknown_variant_fails() {
        assert!(serde_json::from_str::<LabelSource>(r#"{"template": "x"}"#).is_err());
    }
}
