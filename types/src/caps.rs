//! Capability descriptors carried by ports.
//!
//! A descriptor is the subset of a caps string the graph model cares about:
//! media type, optional memory feature, pixel format and dimensions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media kind derived from a descriptor's media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

/// Resolved capability descriptor of a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsDescriptor {
    /// Media type such as `video/x-raw`, or `ANY` for the wildcard
    pub media_type: String,
    /// Memory feature, e.g. `NVMM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Pixel format, e.g. `NV12`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

const ANY: &str = "ANY";

/// Error returned when a caps string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsParseError(pub String);

impl fmt::Display for CapsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid caps string: {}", self.0)
    }
}

impl std::error::Error for CapsParseError {}

impl CapsDescriptor {
    /// Descriptor accepting any media.
    pub fn any() -> Self {
        Self {
            media_type: ANY.to_string(),
            memory: None,
            format: None,
            width: None,
            height: None,
        }
    }

    /// Plain descriptor for a media type.
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            ..Self::any()
        }
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn is_any(&self) -> bool {
        self.media_type == ANY
    }

    pub fn kind(&self) -> MediaKind {
        let top = self.media_type.split('/').next().unwrap_or_default();
        match top {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            _ => MediaKind::Other,
        }
    }

    /// Intersect two descriptors. Returns `None` when they cannot agree.
    ///
    /// `ANY` yields the other side unchanged. Unset fields adopt the value of
    /// the other side; set fields must match.
    pub fn intersect(&self, other: &CapsDescriptor) -> Option<CapsDescriptor> {
        if self.is_any() {
            return Some(other.clone());
        }
        if other.is_any() {
            return Some(self.clone());
        }
        if self.media_type != other.media_type {
            return None;
        }

        Some(CapsDescriptor {
            media_type: self.media_type.clone(),
            memory: merge_field(&self.memory, &other.memory)?,
            format: merge_field(&self.format, &other.format)?,
            width: merge_field(&self.width, &other.width)?,
            height: merge_field(&self.height, &other.height)?,
        })
    }
}

fn merge_field<T: Clone + PartialEq>(a: &Option<T>, b: &Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => None,
        (Some(x), _) => Some(Some(x.clone())),
        (None, y) => Some(y.clone()),
    }
}

impl FromStr for CapsDescriptor {
    type Err = CapsParseError;

    /// Parse a caps string such as `video/x-raw(memory:NVMM), format=NV12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let head = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CapsParseError(s.to_string()))?;

        if head == ANY {
            return Ok(Self::any());
        }

        let mut desc = match head.split_once('(') {
            Some((media_type, feature)) => {
                let feature = feature
                    .strip_suffix(')')
                    .ok_or_else(|| CapsParseError(s.to_string()))?;
                let memory = feature.strip_prefix("memory:").unwrap_or(feature);
                CapsDescriptor::new(media_type.trim()).with_memory(memory)
            }
            None => CapsDescriptor::new(head),
        };
        if !desc.media_type.contains('/') {
            return Err(CapsParseError(s.to_string()));
        }

        for field in parts.filter(|p| !p.is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| CapsParseError(s.to_string()))?;
            let value = strip_type_annotation(value.trim());
            match key.trim() {
                "format" => desc.format = Some(value.to_string()),
                "width" => desc.width = value.parse().ok(),
                "height" => desc.height = value.parse().ok(),
                // Other fields do not take part in graph validation
                _ => {}
            }
        }

        Ok(desc)
    }
}

/// Strip a leading `(type)` annotation, as in `(string)NV12`.
fn strip_type_annotation(value: &str) -> &str {
    if value.starts_with('(') {
        if let Some((_, rest)) = value.split_once(')') {
            return rest.trim();
        }
    }
    value
}

impl fmt::Display for CapsDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        if let Some(memory) = &self.memory {
            write!(f, "(memory:{})", memory)?;
        }
        if let Some(format) = &self.format {
            write!(f, ", format={}", format)?;
        }
        if let Some(width) = self.width {
            write!(f, ", width={}", width)?;
        }
        if let Some(height) = self.height {
            write!(f, ", height={}", height)?;
        }
        Ok(())
    }
}
