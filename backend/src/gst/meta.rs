//! Access to per-buffer batch metadata.
//!
//! The annotation hook works on a [`FrameBatch`]. How that batch is stored
//! on a buffer depends on the inference engine, so the probe goes through
//! [`BatchMetaAccess`]. [`RoiBatchMeta`] stores detections and overlay text
//! as `GstVideoRegionOfInterestMeta` entries. DeepStream builds use the
//! engine's own batch meta (see `nvds`).

use gstreamer as gst;
use gstreamer_video as gst_video;
use gst_video::VideoRegionOfInterestMeta;
use osdcast_types::{
    BBox, DisplayMeta, FontDescriptor, FrameBatch, FrameMeta, ObjectMeta, Rgba,
};
use tracing::trace;

/// ROI type of overlay text entries.
pub const DISPLAY_TEXT_ROI: &str = "display-text";

const DETECTION_PARAM: &str = "ObjectDetection";
const ANNOTATION_PARAM: &str = "Annotation";
const DISPLAY_TEXT_PARAM: &str = "DisplayText";

/// Read-modify-write access to the batch carried by a buffer.
pub trait BatchMetaAccess: Send + Sync + 'static {
    /// Run `f` on the buffer's batch and store the result back.
    ///
    /// Returns `false` when the buffer carries no batch. `f` is not called
    /// in that case.
    fn with_batch_mut(
        &self,
        buffer: &mut gst::BufferRef,
        f: &mut dyn FnMut(&mut FrameBatch),
    ) -> bool;
}

/// Changes an annotation pass made to one frame.
///
/// Object display text and appended overlay items are the only parts of a
/// frame written back to the buffer.
#[derive(Debug, Default, PartialEq)]
pub struct FrameEdits<'a> {
    /// Position in the frame's object list and the new display text
    pub relabeled: Vec<(usize, &'a str)>,
    /// Overlay items added after the ones the frame arrived with
    pub appended: &'a [DisplayMeta],
}

impl<'a> FrameEdits<'a> {
    pub fn between(before: &FrameMeta, after: &'a FrameMeta) -> Self {
        let relabeled = before
            .objects
            .iter()
            .zip(&after.objects)
            .enumerate()
            .filter(|(_, (old, new))| old.display_text() != new.display_text())
            .map(|(index, (_, new))| (index, new.display_text()))
            .collect();
        let appended = after
            .display_meta
            .get(before.display_meta.len()..)
            .unwrap_or_default();
        Self {
            relabeled,
            appended,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relabeled.is_empty() && self.appended.is_empty()
    }

    pub fn text_for(&self, index: usize) -> Option<&'a str> {
        self.relabeled
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, text)| *text)
    }
}

/// Batch stored as region-of-interest metas, one frame per buffer.
///
/// Every buffer reads as a one-frame batch, possibly without objects, so
/// a batch is always present.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoiBatchMeta;

impl BatchMetaAccess for RoiBatchMeta {
    fn with_batch_mut(
        &self,
        buffer: &mut gst::BufferRef,
        f: &mut dyn FnMut(&mut FrameBatch),
    ) -> bool {
        let before = read_batch(buffer);
        let mut after = before.clone();
        f(&mut after);

        for (old, new) in before.frames.iter().zip(&after.frames) {
            let edits = FrameEdits::between(old, new);
            if !edits.is_empty() {
                apply_edits(buffer, &edits);
            }
        }
        true
    }
}

/// Decode the ROI metas of a buffer into a single-frame batch.
pub fn read_batch(buffer: &gst::BufferRef) -> FrameBatch {
    let mut frame = FrameMeta::new(buffer.offset());

    for roi in buffer.iter_meta::<VideoRegionOfInterestMeta>() {
        let (x, y, w, h) = roi.rect();
        if roi.roi_type() == DISPLAY_TEXT_ROI {
            if let Some(display) = roi.param(DISPLAY_TEXT_PARAM).map(|p| read_display(p, x, y)) {
                frame.display_meta.push(display);
            }
            continue;
        }

        let bbox = BBox {
            left: x as f32,
            top: y as f32,
            width: w as f32,
            height: h as f32,
        };
        let detection = roi.param(DETECTION_PARAM);
        let confidence = detection
            .and_then(|p| p.get::<f64>("confidence").ok())
            .unwrap_or(0.0) as f32;
        let class_id = detection
            .and_then(|p| p.get::<i32>("class-id").ok())
            .unwrap_or(-1);
        let label = roi.roi_type().to_string();

        let mut object = match detection.and_then(|p| p.get::<u64>("tracking-id").ok()) {
            Some(id) => ObjectMeta::tracked(class_id, label, bbox, confidence, id),
            None => ObjectMeta::new(class_id, label, bbox, confidence),
        };
        if let Some(text) = roi
            .param(ANNOTATION_PARAM)
            .and_then(|p| p.get::<String>("display-text").ok())
        {
            object.set_display_text(text);
        }
        frame.objects.push(object);
    }

    FrameBatch::new(vec![frame])
}

fn read_display(param: &gst::StructureRef, x: u32, y: u32) -> DisplayMeta {
    let color = |prefix: &str| {
        let c = |name: &str| param.get::<f64>(format!("{}{}", prefix, name).as_str()).ok();
        Some(Rgba::new(c("red")?, c("green")?, c("blue")?, c("alpha")?))
    };

    DisplayMeta {
        text: param.get::<String>("text").unwrap_or_default(),
        x_offset: x,
        y_offset: y,
        font: FontDescriptor {
            name: param.get::<String>("font-name").unwrap_or_default(),
            size: param.get::<u32>("font-size").unwrap_or_default(),
            color: color("font-").unwrap_or(Rgba::WHITE),
        },
        background: color("bg-"),
    }
}

/// Write `edits` back onto the buffer's ROI metas.
///
/// Changed display text replaces the `Annotation` param of the matching
/// object ROI in place. Other params and ROI ids are untouched. Each
/// appended overlay item becomes a new `display-text` ROI.
fn apply_edits(buffer: &mut gst::BufferRef, edits: &FrameEdits) {
    if !edits.relabeled.is_empty() {
        let objects = buffer
            .iter_meta_mut::<VideoRegionOfInterestMeta>()
            .filter(|roi| roi.roi_type() != DISPLAY_TEXT_ROI);
        for (index, mut roi) in objects.enumerate() {
            if let Some(text) = edits.text_for(index) {
                set_annotation(&mut roi, text);
            }
        }
    }

    for display in edits.appended {
        add_display_roi(buffer, display);
    }

    trace!(
        "Wrote {} labels, {} overlay items",
        edits.relabeled.len(),
        edits.appended.len()
    );
}

fn set_annotation(roi: &mut VideoRegionOfInterestMeta, text: &str) {
    if let Some(param) = annotation_param_mut(roi) {
        param.set("display-text", text);
        return;
    }
    roi.add_param(
        gst::Structure::builder(ANNOTATION_PARAM)
            .field("display-text", text)
            .build(),
    );
}

/// The ROI's `Annotation` param, borrowed mutably.
fn annotation_param_mut(
    roi: &mut VideoRegionOfInterestMeta,
) -> Option<&mut gst::StructureRef> {
    let raw = roi as *mut VideoRegionOfInterestMeta
        as *mut gst_video::ffi::GstVideoRegionOfInterestMeta;
    // SAFETY: the meta wrapper is a transparent view of the C struct. Its
    // params list holds GstStructures owned by the meta, which is borrowed
    // mutably for the lifetime of the result.
    unsafe {
        let mut node = (*raw).params;
        while !node.is_null() {
            let structure = (*node).data as *mut gst::ffi::GstStructure;
            if !structure.is_null() {
                let param = gst::StructureRef::from_glib_borrow_mut(structure);
                if param.has_name(ANNOTATION_PARAM) {
                    return Some(param);
                }
            }
            node = (*node).next;
        }
    }
    None
}

fn add_display_roi(buffer: &mut gst::BufferRef, display: &DisplayMeta) {
    let mut meta = VideoRegionOfInterestMeta::add(
        buffer,
        DISPLAY_TEXT_ROI,
        (display.x_offset, display.y_offset, 0, 0),
    );
    let font = display.font.color;
    let mut param = gst::Structure::builder(DISPLAY_TEXT_PARAM)
        .field("text", display.text.as_str())
        .field("font-name", display.font.name.as_str())
        .field("font-size", display.font.size)
        .field("font-red", font.red)
        .field("font-green", font.green)
        .field("font-blue", font.blue)
        .field("font-alpha", font.alpha);
    if let Some(bg) = display.background {
        param = param
            .field("bg-red", bg.red)
            .field("bg-green", bg.green)
            .field("bg-blue", bg.blue)
            .field("bg-alpha", bg.alpha);
    }
    meta.add_param(param.build());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Annotator;
    use crate::fps::Rate;

    fn detection_buffer() -> gst::Buffer {
        gst::init().unwrap();
        let mut buffer = gst::Buffer::new();
        {
            let buffer = buffer.get_mut().unwrap();
            buffer.set_offset(7);
            let mut meta = VideoRegionOfInterestMeta::add(buffer, "car", (10, 20, 30, 40));
            meta.add_param(
                gst::Structure::builder(DETECTION_PARAM)
                    .field("confidence", 0.87f64)
                    .field("class-id", 2i32)
                    .field("tracking-id", 12u64)
                    .build(),
            );
            meta.add_param(
                gst::Structure::builder(ANNOTATION_PARAM)
                    .field("display-text", "car 12 0.87")
                    .build(),
            );
        }
        buffer
    }

    #[test]
    fn test_read_detections() {
        let buffer = detection_buffer();
        let batch = read_batch(&buffer);

        assert_eq!(batch.len(), 1);
        let frame = &batch.frames[0];
        assert_eq!(frame.frame_index, 7);
        let object = &frame.objects[0];
        assert_eq!(object.label, "car");
        assert_eq!(object.class_id, 2);
        assert_eq!(object.tracking_id(), 12);
        assert_eq!(object.display_text(), "car 12 0.87");
        assert_eq!(object.bbox.width, 30.0);
    }

    #[test]
    fn test_annotation_written_back() {
        let mut buffer = detection_buffer();
        let annotator = Annotator::default();

        let present = RoiBatchMeta.with_batch_mut(buffer.get_mut().unwrap(), &mut |batch| {
            annotator.annotate(batch, Some(Rate::new(29.96)))
        });
        assert!(present);

        let batch = read_batch(&buffer);
        let frame = &batch.frames[0];
        assert_eq!(frame.objects.len(), 1);
        assert_eq!(frame.objects[0].display_text(), "car");
        assert_eq!(frame.objects[0].tracking_id(), 12);
        assert_eq!(frame.display_meta.len(), 1);
        assert_eq!(frame.display_meta[0].text, "FPS: 30.0");
        assert_eq!(frame.display_meta[0].x_offset, 10);
        assert_eq!(frame.display_meta[0].font.name, "Serif");
        assert_eq!(frame.display_meta[0].background.unwrap().alpha, 0.5);
    }

    #[test]
    fn test_empty_buffer_still_gets_overlay() {
        gst::init().unwrap();
        let mut buffer = gst::Buffer::new();
        let annotator = Annotator::default();

        RoiBatchMeta.with_batch_mut(buffer.get_mut().unwrap(), &mut |batch| {
            annotator.annotate(batch, None)
        });

        let batch = read_batch(&buffer);
        assert!(batch.frames[0].objects.is_empty());
        assert_eq!(batch.frames[0].display_meta[0].text, "FPS: 0.0");
    }

    #[test]
    fn test_edits_keep_other_params_and_ids() {
        let mut buffer = detection_buffer();
        {
            let buffer = buffer.get_mut().unwrap();
            let mut roi = buffer
                .iter_meta_mut::<VideoRegionOfInterestMeta>()
                .next()
                .unwrap();
            roi.set_id(3);
            roi.set_parent_id(1);
            roi.add_param(
                gst::Structure::builder("Classification")
                    .field("label", "sedan")
                    .build(),
            );
        }

        let annotator = Annotator::default();
        for _ in 0..2 {
            RoiBatchMeta.with_batch_mut(buffer.get_mut().unwrap(), &mut |batch| {
                annotator.annotate(batch, Some(Rate::new(30.0)))
            });
        }

        let car = buffer
            .iter_meta::<VideoRegionOfInterestMeta>()
            .find(|roi| roi.roi_type() == "car")
            .unwrap();
        assert_eq!(car.id(), 3);
        assert_eq!(car.parent_id(), 1);
        assert_eq!(car.rect(), (10, 20, 30, 40));
        assert_eq!(
            car.param("Classification")
                .and_then(|p| p.get::<String>("label").ok())
                .as_deref(),
            Some("sedan")
        );
        assert_eq!(
            car.param(DETECTION_PARAM)
                .and_then(|p| p.get::<u64>("tracking-id").ok()),
            Some(12)
        );
        assert_eq!(
            car.params().filter(|p| p.has_name(ANNOTATION_PARAM)).count(),
            1
        );
        assert_eq!(
            car.param(ANNOTATION_PARAM)
                .and_then(|p| p.get::<String>("display-text").ok())
                .as_deref(),
            Some("car")
        );

        // One overlay per pass
        let overlays = buffer
            .iter_meta::<VideoRegionOfInterestMeta>()
            .filter(|roi| roi.roi_type() == DISPLAY_TEXT_ROI)
            .count();
        assert_eq!(overlays, 2);
    }

    #[test]
    fn test_missing_annotation_param_added() {
        gst::init().unwrap();
        let mut buffer = gst::Buffer::new();
        {
            let buffer = buffer.get_mut().unwrap();
            let mut meta = VideoRegionOfInterestMeta::add(buffer, "dog", (0, 0, 8, 8));
            meta.add_param(
                gst::Structure::builder(DETECTION_PARAM)
                    .field("confidence", 0.5f64)
                    .field("class-id", 16i32)
                    .build(),
            );
        }

        RoiBatchMeta.with_batch_mut(buffer.get_mut().unwrap(), &mut |batch| {
            Annotator::default().annotate(batch, None)
        });

        let batch = read_batch(&buffer);
        assert_eq!(batch.frames[0].objects[0].display_text(), "dog");
        assert!(!batch.frames[0].objects[0].is_tracked());
    }

    #[test]
    fn test_frame_edits() {
        let before = FrameMeta::new(0).with_objects(vec![
            ObjectMeta::new(0, "person", BBox::default(), 0.9).with_display_text("person"),
            ObjectMeta::tracked(2, "car", BBox::default(), 0.8, 4).with_display_text("car 4 0.80"),
        ]);
        let mut batch = FrameBatch::new(vec![before.clone()]);
        Annotator::default().annotate(&mut batch, Some(Rate::new(12.0)));
        let after = &batch.frames[0];

        let edits = FrameEdits::between(&before, after);
        assert_eq!(edits.relabeled, vec![(1, "car")]);
        assert_eq!(edits.text_for(1), Some("car"));
        assert_eq!(edits.text_for(0), None);
        assert_eq!(edits.appended.len(), 1);
        assert_eq!(edits.appended[0].text, "FPS: 12.0");

        assert!(FrameEdits::between(&before, &before).is_empty());
    }

    #[test]
    fn test_unchanged_batch_not_rewritten() {
        let mut buffer = detection_buffer();
        RoiBatchMeta.with_batch_mut(buffer.get_mut().unwrap(), &mut |_| {});

        let annotation = buffer
            .iter_meta::<VideoRegionOfInterestMeta>()
            .next()
            .and_then(|m| m.param(ANNOTATION_PARAM).map(|p| p.to_owned()));
        assert!(annotation.is_some());
        assert_eq!(buffer.iter_meta::<VideoRegionOfInterestMeta>().count(), 1);
    }
}
