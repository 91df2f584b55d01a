//! Per-frame annotation of detection metadata.
//!
//! Two hooks touch every buffer: the rate hook (before the overlay convert
//! stage) counts the frame, the annotation hook (at the overlay input) reads
//! the rate and mutates the batch. [`StreamContext`] sequences them so the
//! rate read for a frame always includes that frame.

use crate::fps::{FrameRateMonitor, Rate};
use osdcast_types::{DisplayMeta, FontDescriptor, FrameBatch, Rgba};
use std::time::Instant;
use tracing::trace;

/// Label printed in front of the rate when none is configured.
pub const DEFAULT_OVERLAY_LABEL: &str = "FPS";

const OVERLAY_X: u32 = 10;
const OVERLAY_Y: u32 = 12;
const OVERLAY_FONT: &str = "Serif";
const OVERLAY_FONT_SIZE: u32 = 14;
const OVERLAY_BACKGROUND: Rgba = Rgba::new(0.0, 0.0, 0.0, 0.5);

/// Rewrites object labels and appends the rate overlay.
#[derive(Debug, Clone)]
pub struct Annotator {
    label: String,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAY_LABEL)
    }
}

impl Annotator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    /// Overlay item carrying the rate. A missing rate renders as `0.0`.
    pub fn rate_overlay(&self, rate: Option<Rate>) -> DisplayMeta {
        let rate = rate.unwrap_or(Rate::new(0.0));
        DisplayMeta {
            text: format!("{}: {}", self.label, rate),
            x_offset: OVERLAY_X,
            y_offset: OVERLAY_Y,
            font: FontDescriptor {
                name: OVERLAY_FONT.to_string(),
                size: OVERLAY_FONT_SIZE,
                color: Rgba::WHITE,
            },
            background: Some(OVERLAY_BACKGROUND),
        }
    }

    /// Mutate every frame of the batch in place.
    ///
    /// Each frame gets one more rate overlay, even if an earlier pass already
    /// appended one. Object display text is reduced to the class label.
    pub fn annotate(&self, batch: &mut FrameBatch, rate: Option<Rate>) {
        let overlay = self.rate_overlay(rate);

        for frame in &mut batch.frames {
            frame.display_meta.push(overlay.clone());
            for object in &mut frame.objects {
                object.set_display_text(object.label.clone());
            }
            trace!(
                "Annotated frame {} ({} objects)",
                frame.frame_index,
                frame.objects.len()
            );
        }
    }
}

/// Annotate with the default overlay label.
pub fn annotate(batch: &mut FrameBatch, rate: Option<Rate>) {
    Annotator::default().annotate(batch, rate);
}

/// Per-stream state shared by the rate and annotation hooks.
#[derive(Debug)]
pub struct StreamContext {
    monitor: FrameRateMonitor,
    annotator: Annotator,
    advanced: u64,
    annotated: u64,
}

impl StreamContext {
    pub fn new(stream_id: u32, annotator: Annotator) -> Self {
        Self {
            monitor: FrameRateMonitor::new(stream_id),
            annotator,
            advanced: 0,
            annotated: 0,
        }
    }

    pub fn monitor(&self) -> &FrameRateMonitor {
        &self.monitor
    }

    /// Rate hook: one frame crossed the pre-overlay boundary.
    pub fn on_rate_boundary(&mut self, now: Instant) -> Option<Rate> {
        self.advanced += 1;
        self.monitor.advance(now)
    }

    /// Rate to show for the frame now crossing the annotation boundary.
    ///
    /// Advances the monitor itself when the rate hook has not counted this
    /// frame yet.
    pub fn annotation_rate(&mut self, now: Instant) -> Option<Rate> {
        self.annotated += 1;
        if self.annotated > self.advanced {
            return self.on_rate_boundary(now);
        }
        self.monitor.current()
    }

    /// Annotation hook: read the rate and mutate the batch.
    pub fn on_annotation_boundary(&mut self, batch: &mut FrameBatch, now: Instant) {
        let rate = self.annotation_rate(now);
        self.annotator.annotate(batch, rate);
    }
}
