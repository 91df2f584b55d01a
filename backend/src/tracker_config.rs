//! Tracker configuration file loading.
//!
//! The file is INI text; only the `[tracker]` section is read. Recognized keys
//! become tracker stage properties. Unknown keys and malformed values are
//! logged as [`ConfigParseWarning`]s and otherwise ignored.

use osdcast_types::PropertyValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const SECTION: &str = "tracker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Int,
    Bool,
    Path,
}

/// Keys mapped directly to tracker stage properties.
const RECOGNIZED_KEYS: &[(&str, ValueKind)] = &[
    ("tracker-width", ValueKind::Int),
    ("tracker-height", ValueKind::Int),
    ("gpu-id", ValueKind::Int),
    ("ll-lib-file", ValueKind::Path),
    ("ll-config-file", ValueKind::Path),
    ("enable-batch-process", ValueKind::Bool),
    ("enable-past-frame", ValueKind::Bool),
];

/// A key or value that was skipped while reading the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigParseWarning {
    pub line: usize,
    pub key: String,
    pub reason: String,
}

impl fmt::Display for ConfigParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}: {}", self.line, self.key, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum TrackerConfigError {
    #[error("Failed to read tracker config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracker config {0} has no [tracker] section")]
    MissingSection(String),
}

/// Parsed tracker settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerConfig {
    pub properties: BTreeMap<String, PropertyValue>,
    pub warnings: Vec<ConfigParseWarning>,
}

impl TrackerConfig {
    /// Read and parse a tracker config file.
    pub fn load(path: &Path) -> Result<Self, TrackerConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| TrackerConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&text)
            .ok_or_else(|| TrackerConfigError::MissingSection(path.display().to_string()))?;

        for warning in &config.warnings {
            warn!("Ignoring tracker config entry ({}): {}", path.display(), warning);
        }
        debug!(
            "Loaded {} tracker properties from {}",
            config.properties.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse INI text. Returns `None` when there is no `[tracker]` section.
    pub fn parse(text: &str) -> Option<Self> {
        let mut config = TrackerConfig::default();
        let mut in_section = false;
        let mut seen_section = false;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = name.trim() == SECTION;
                seen_section |= in_section;
                continue;
            }
            if !in_section {
                continue;
            }

            let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
                config.warn(line_no, line, "expected key=value");
                continue;
            };
            // Keys are case-insensitive, and `_` and `-` are interchangeable
            let key = key.trim().to_ascii_lowercase().replace('_', "-");
            let value = value.trim();

            let Some(&(name, kind)) = RECOGNIZED_KEYS.iter().find(|(k, _)| *k == key) else {
                config.warn(line_no, &key, "unrecognized key");
                continue;
            };

            match parse_value(kind, value) {
                Some(v) => {
                    config.properties.insert(name.to_string(), v);
                }
                None => config.warn(line_no, &key, &format!("malformed value '{}'", value)),
            }
        }

        seen_section.then_some(config)
    }

    fn warn(&mut self, line: usize, key: &str, reason: &str) {
        self.warnings.push(ConfigParseWarning {
            line,
            key: key.to_string(),
            reason: reason.to_string(),
        });
    }
}

fn parse_value(kind: ValueKind, value: &str) -> Option<PropertyValue> {
    match kind {
        ValueKind::Int => value.parse::<i64>().ok().map(PropertyValue::Int),
        ValueKind::Bool => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(PropertyValue::Bool(true)),
            "0" | "false" | "no" | "off" => Some(PropertyValue::Bool(false)),
            _ => None,
        },
        ValueKind::Path if !value.is_empty() => Some(PropertyValue::String(value.to_string())),
        ValueKind::Path => None,
    }
}
