//! Stage, port and configuration value definitions.

use serde::{Deserialize, Serialize};

/// Processing role of a stage in the pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Source,
    FormatConvert,
    Mux,
    Inference,
    Tracker,
    Convert,
    OverlayCompositor,
    FormatConvertPost,
    CapabilityFilter,
    Encoder,
    Payloader,
    Sink,
}

impl StageKind {
    /// Configuration keys a stage of this kind cannot be built without.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            StageKind::Mux => &["width", "height", "batch-size"],
            StageKind::Inference => &["config-file-path"],
            StageKind::CapabilityFilter => &["caps"],
            StageKind::Encoder => &["bitrate"],
            StageKind::Sink => &["host", "port"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::FormatConvert => "format-convert",
            Self::Mux => "mux",
            Self::Inference => "inference",
            Self::Tracker => "tracker",
            Self::Convert => "convert",
            Self::OverlayCompositor => "overlay-compositor",
            Self::FormatConvertPost => "format-convert-post",
            Self::CapabilityFilter => "capability-filter",
            Self::Encoder => "encoder",
            Self::Payloader => "payloader",
            Self::Sink => "sink",
        };
        f.write_str(name)
    }
}

/// Data flow direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Port presence type (static, dynamic, or request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortPresence {
    /// Always present (static pad)
    Always,
    /// Created at runtime once the stream type is known
    Sometimes,
    /// Created on request at construction time
    Request,
}

/// Configuration value applied to a stage at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::UInt(u) => write!(f, "{}", u),
            PropertyValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<u64> for PropertyValue {
    fn from(u: u64) -> Self {
        PropertyValue::UInt(u)
    }
}

impl From<u32> for PropertyValue {
    fn from(u: u32) -> Self {
        PropertyValue::UInt(u as u64)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_keys() {
        assert_eq!(StageKind::Inference.required_keys(), &["config-file-path"]);
        assert!(StageKind::Tracker.required_keys().is_empty());
        assert!(StageKind::Sink.required_keys().contains(&"port"));
    }

    #[test]
    fn test_stage_kind_display_matches_serde() {
        let json = serde_json::to_string(&StageKind::OverlayCompositor).unwrap();
        assert_eq!(json, "\"overlay-compositor\"");
        assert_eq!(StageKind::OverlayCompositor.to_string(), "overlay-compositor");
    }

    #[test]
    fn test_property_value_untagged() {
        let values: Vec<PropertyValue> =
            serde_json::from_str(r#"["serif", -3, true]"#).unwrap();
        assert_eq!(values[0], PropertyValue::from("serif"));
        assert_eq!(values[1], PropertyValue::Int(-3));
        assert_eq!(values[2], PropertyValue::Bool(true));
    }
}
