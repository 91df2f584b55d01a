//! Per-frame detection and overlay metadata.
//!
//! A [`FrameBatch`] holds one [`FrameMeta`] per source frame muxed into the
//! same buffer. Object tracking ids are fixed once an [`ObjectMeta`] exists;
//! downstream code may only rewrite the text shown next to the object.

use serde::{Deserialize, Serialize};

/// Tracking id of an object the tracker never assigned.
pub const UNTRACKED_OBJECT_ID: u64 = u64::MAX;

/// RGBA color with components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(red: f64, green: f64, blue: f64, alpha: f64) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }
}

/// Axis-aligned bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontDescriptor {
    pub name: String,
    pub size: u32,
    pub color: Rgba,
}

/// One overlay text item drawn by the compositor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMeta {
    pub text: String,
    pub x_offset: u32,
    pub y_offset: u32,
    pub font: FontDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Rgba>,
}

/// A single detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub class_id: i32,
    pub label: String,
    pub bbox: BBox,
    pub confidence: f32,
    tracking_id: u64,
    display_text: String,
}

impl ObjectMeta {
    /// Create an untracked detection. The display text starts empty.
    pub fn new(class_id: i32, label: impl Into<String>, bbox: BBox, confidence: f32) -> Self {
        Self {
            class_id,
            label: label.into(),
            bbox,
            confidence,
            tracking_id: UNTRACKED_OBJECT_ID,
            display_text: String::new(),
        }
    }

    /// Create a detection carrying the id assigned by the tracker.
    pub fn tracked(
        class_id: i32,
        label: impl Into<String>,
        bbox: BBox,
        confidence: f32,
        tracking_id: u64,
    ) -> Self {
        Self {
            tracking_id,
            ..Self::new(class_id, label, bbox, confidence)
        }
    }

    /// Attach the text composed upstream (e.g. `"car 12 0.87"`).
    pub fn with_display_text(mut self, text: impl Into<String>) -> Self {
        self.display_text = text.into();
        self
    }

    pub fn tracking_id(&self) -> u64 {
        self.tracking_id
    }

    pub fn is_tracked(&self) -> bool {
        self.tracking_id != UNTRACKED_OBJECT_ID
    }

    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    pub fn set_display_text(&mut self, text: impl Into<String>) {
        self.display_text = text.into();
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame_index: u64,
    pub objects: Vec<ObjectMeta>,
    /// Overlay items, append-only during annotation
    pub display_meta: Vec<DisplayMeta>,
}

impl FrameMeta {
    pub fn new(frame_index: u64) -> Self {
        Self {
            frame_index,
            ..Default::default()
        }
    }

    pub fn with_objects(mut self, objects: Vec<ObjectMeta>) -> Self {
        self.objects = objects;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameBatch {
    pub frames: Vec<FrameMeta>,
}

impl FrameBatch {
    pub fn new(frames: Vec<FrameMeta>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
