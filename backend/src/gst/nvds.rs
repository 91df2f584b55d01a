//! DeepStream batch metadata.
//!
//! `nvstreammux` attaches an `NvDsBatchMeta` to every batched buffer,
//! `nvinfer` and `nvtracker` hang object metas off its frames, and
//! `nvdsosd` draws object text and display metas from it. This binding
//! reads that tree into a [`FrameBatch`] and writes annotation edits back
//! the way DeepStream applications do: object text is replaced in
//! `text_params.display_text`, and overlay items go into display metas
//! acquired from the batch's pool.
//!
//! The `#[repr(C)]` structs mirror the leading fields of `nvdsmeta.h` and
//! `nvll_osd_struct.h` (DeepStream 6.x and 7.x). Only the fields up to the
//! last one used are declared. Values are only reached through pointers the
//! DeepStream libraries hand out, never constructed or moved by value.

use super::meta::{BatchMetaAccess, FrameEdits};
use gstreamer as gst;
use gstreamer::glib;
use osdcast_types::{
    BBox, DisplayMeta, FontDescriptor, FrameBatch, FrameMeta, ObjectMeta, Rgba,
    UNTRACKED_OBJECT_ID,
};
use std::ffi::{c_char, c_uint, c_void, CStr, CString};
use tracing::{trace, warn};

/// Text slots per display meta.
const MAX_ELEMENTS_IN_DISPLAY_META: usize = 16;
const MAX_LABEL_SIZE: usize = 128;

#[allow(dead_code)]
mod ffi {
    use super::{MAX_ELEMENTS_IN_DISPLAY_META, MAX_LABEL_SIZE};
    use gstreamer as gst;
    use gstreamer::glib;
    use std::ffi::{c_char, c_int, c_uint, c_void};

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct NvOsdColorParams {
        pub red: f64,
        pub green: f64,
        pub blue: f64,
        pub alpha: f64,
    }

    #[repr(C)]
    pub struct NvOsdFontParams {
        pub font_name: *mut c_char,
        pub font_size: c_uint,
        pub font_color: NvOsdColorParams,
    }

    #[repr(C)]
    pub struct NvOsdTextParams {
        pub display_text: *mut c_char,
        pub x_offset: c_uint,
        pub y_offset: c_uint,
        pub font_params: NvOsdFontParams,
        pub set_bg_clr: c_int,
        pub text_bg_clr: NvOsdColorParams,
    }

    #[repr(C)]
    pub struct NvOsdRectParams {
        pub left: f32,
        pub top: f32,
        pub width: f32,
        pub height: f32,
        pub border_width: c_uint,
        pub border_color: NvOsdColorParams,
        pub has_bg_color: c_uint,
        pub reserved: c_uint,
        pub bg_color: NvOsdColorParams,
        pub has_color_info: c_int,
        pub color_id: c_int,
    }

    #[repr(C)]
    pub struct NvOsdMaskParams {
        pub data: *mut f32,
        pub size: c_uint,
        pub threshold: f32,
        pub width: c_uint,
        pub height: c_uint,
    }

    #[repr(C)]
    pub struct NvBboxCoords {
        pub left: f32,
        pub top: f32,
        pub width: f32,
        pub height: f32,
    }

    #[repr(C)]
    pub struct NvDsBaseMeta {
        pub batch_meta: *mut NvDsBatchMeta,
        pub meta_type: c_int,
        pub u_context: *mut c_void,
        pub copy_func: *mut c_void,
        pub release_func: *mut c_void,
    }

    #[repr(C)]
    pub struct NvDsBatchMeta {
        pub base_meta: NvDsBaseMeta,
        pub max_frames_in_batch: c_uint,
        pub num_frames_in_batch: c_uint,
        pub frame_meta_pool: *mut c_void,
        pub obj_meta_pool: *mut c_void,
        pub classifier_meta_pool: *mut c_void,
        pub display_meta_pool: *mut c_void,
        pub user_meta_pool: *mut c_void,
        pub label_info_meta_pool: *mut c_void,
        pub frame_meta_list: *mut glib::ffi::GList,
    }

    #[repr(C)]
    pub struct NvDsFrameMeta {
        pub base_meta: NvDsBaseMeta,
        pub pad_index: c_uint,
        pub batch_id: c_uint,
        pub frame_num: c_int,
        pub buf_pts: u64,
        pub ntp_timestamp: u64,
        pub source_id: c_uint,
        pub num_surfaces_per_frame: c_int,
        pub source_frame_width: c_uint,
        pub source_frame_height: c_uint,
        pub surface_type: c_uint,
        pub surface_index: c_uint,
        pub num_obj_meta: c_uint,
        pub b_infer_done: c_int,
        pub obj_meta_list: *mut glib::ffi::GList,
        pub display_meta_list: *mut glib::ffi::GList,
    }

    #[repr(C)]
    pub struct NvDsObjectMeta {
        pub base_meta: NvDsBaseMeta,
        pub parent: *mut NvDsObjectMeta,
        pub unique_component_id: c_uint,
        pub class_id: c_int,
        pub object_id: u64,
        pub detector_bbox_info: NvBboxCoords,
        pub tracker_bbox_info: NvBboxCoords,
        pub confidence: f32,
        pub tracker_confidence: f32,
        pub rect_params: NvOsdRectParams,
        pub mask_params: NvOsdMaskParams,
        pub text_params: NvOsdTextParams,
        pub obj_label: [c_char; MAX_LABEL_SIZE],
    }

    #[repr(C)]
    pub struct NvDsDisplayMeta {
        pub base_meta: NvDsBaseMeta,
        pub num_rects: c_uint,
        pub num_labels: c_uint,
        pub num_lines: c_uint,
        pub num_arrows: c_uint,
        pub num_circles: c_uint,
        pub rect_params: [NvOsdRectParams; MAX_ELEMENTS_IN_DISPLAY_META],
        pub text_params: [NvOsdTextParams; MAX_ELEMENTS_IN_DISPLAY_META],
    }

    #[link(name = "nvdsgst_meta")]
    extern "C" {
        pub fn gst_buffer_get_nvds_batch_meta(buffer: *mut gst::ffi::GstBuffer)
            -> *mut NvDsBatchMeta;
    }

    #[link(name = "nvds_meta")]
    extern "C" {
        pub fn nvds_acquire_meta_lock(batch_meta: *mut NvDsBatchMeta);
        pub fn nvds_release_meta_lock(batch_meta: *mut NvDsBatchMeta);
        pub fn nvds_acquire_display_meta_from_pool(
            batch_meta: *mut NvDsBatchMeta,
        ) -> *mut NvDsDisplayMeta;
        pub fn nvds_add_display_meta_to_frame(
            frame_meta: *mut NvDsFrameMeta,
            display_meta: *mut NvDsDisplayMeta,
        );
    }
}

/// Batch stored as the DeepStream `NvDsBatchMeta` tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepStreamBatchMeta;

impl BatchMetaAccess for DeepStreamBatchMeta {
    fn with_batch_mut(
        &self,
        buffer: &mut gst::BufferRef,
        f: &mut dyn FnMut(&mut FrameBatch),
    ) -> bool {
        // SAFETY: the buffer pointer is valid for the call. A non-null result
        // is owned by the buffer's meta, which outlives this borrow.
        let batch_meta = unsafe { ffi::gst_buffer_get_nvds_batch_meta(buffer.as_mut_ptr()) };
        if batch_meta.is_null() {
            return false;
        }

        let _lock = MetaLock::acquire(batch_meta);
        // SAFETY: the batch meta is valid and locked. Its frame list holds
        // NvDsFrameMeta pointers owned by the batch.
        let frames = unsafe { list_data::<ffi::NvDsFrameMeta>((*batch_meta).frame_meta_list) };
        let before = FrameBatch::new(
            frames
                .iter()
                // SAFETY: see above.
                .map(|&frame| unsafe { read_frame(frame) })
                .collect(),
        );

        let mut after = before.clone();
        f(&mut after);

        for ((&frame, old), new) in frames.iter().zip(&before.frames).zip(&after.frames) {
            let edits = FrameEdits::between(old, new);
            if edits.is_empty() {
                continue;
            }
            // SAFETY: the frame belongs to the locked batch meta.
            unsafe {
                relabel_objects(frame, &edits);
                append_display_meta(batch_meta, frame, edits.appended);
            }
            trace!(
                "Frame {}: {} labels rewritten, {} overlay items added",
                new.frame_index,
                edits.relabeled.len(),
                edits.appended.len()
            );
        }
        true
    }
}

/// Holds the batch meta lock for its lifetime.
struct MetaLock(*mut ffi::NvDsBatchMeta);

impl MetaLock {
    fn acquire(batch_meta: *mut ffi::NvDsBatchMeta) -> Self {
        // SAFETY: callers pass a non-null batch meta taken from a live buffer.
        unsafe { ffi::nvds_acquire_meta_lock(batch_meta) };
        Self(batch_meta)
    }
}

impl Drop for MetaLock {
    fn drop(&mut self) {
        // SAFETY: acquired in `MetaLock::acquire` on the same batch meta.
        unsafe { ffi::nvds_release_meta_lock(self.0) };
    }
}

/// Data pointers of a GList, in list order.
unsafe fn list_data<T>(mut node: *mut glib::ffi::GList) -> Vec<*mut T> {
    let mut items = Vec::new();
    while !node.is_null() {
        if !(*node).data.is_null() {
            items.push((*node).data as *mut T);
        }
        node = (*node).next;
    }
    items
}

unsafe fn read_frame(frame: *const ffi::NvDsFrameMeta) -> FrameMeta {
    let frame = &*frame;
    let mut meta = FrameMeta::new(frame.frame_num.max(0) as u64);

    for object in list_data::<ffi::NvDsObjectMeta>(frame.obj_meta_list) {
        meta.objects.push(read_object(&*object));
    }
    for display in list_data::<ffi::NvDsDisplayMeta>(frame.display_meta_list) {
        let display = &*display;
        let labels = (display.num_labels as usize).min(MAX_ELEMENTS_IN_DISPLAY_META);
        for params in &display.text_params[..labels] {
            meta.display_meta.push(read_text(params));
        }
    }
    meta
}

unsafe fn read_object(object: &ffi::NvDsObjectMeta) -> ObjectMeta {
    let rect = &object.rect_params;
    let bbox = BBox {
        left: rect.left,
        top: rect.top,
        width: rect.width,
        height: rect.height,
    };
    let label = label_text(&object.obj_label);

    let mut meta = if object.object_id == UNTRACKED_OBJECT_ID {
        ObjectMeta::new(object.class_id, label, bbox, object.confidence)
    } else {
        ObjectMeta::tracked(
            object.class_id,
            label,
            bbox,
            object.confidence,
            object.object_id,
        )
    };
    meta.set_display_text(owned_text(object.text_params.display_text));
    meta
}

unsafe fn read_text(params: &ffi::NvOsdTextParams) -> DisplayMeta {
    let font = &params.font_params;
    DisplayMeta {
        text: owned_text(params.display_text),
        x_offset: params.x_offset,
        y_offset: params.y_offset,
        font: FontDescriptor {
            name: owned_text(font.font_name),
            size: font.font_size,
            color: color(font.font_color),
        },
        background: (params.set_bg_clr != 0).then_some(color(params.text_bg_clr)),
    }
}

/// Replace the display text of each relabeled object.
unsafe fn relabel_objects(frame: *mut ffi::NvDsFrameMeta, edits: &FrameEdits) {
    if edits.relabeled.is_empty() {
        return;
    }
    let objects = list_data::<ffi::NvDsObjectMeta>((*frame).obj_meta_list);
    for &(index, text) in &edits.relabeled {
        if let Some(&object) = objects.get(index) {
            replace_text(&mut (*object).text_params.display_text, text);
        }
    }
}

/// Add `items` to the frame, packed into display metas from the batch pool.
unsafe fn append_display_meta(
    batch_meta: *mut ffi::NvDsBatchMeta,
    frame: *mut ffi::NvDsFrameMeta,
    items: &[DisplayMeta],
) {
    for chunk in items.chunks(MAX_ELEMENTS_IN_DISPLAY_META) {
        let display = ffi::nvds_acquire_display_meta_from_pool(batch_meta);
        if display.is_null() {
            warn!("Display meta pool exhausted, dropping {} overlay items", chunk.len());
            return;
        }
        (*display).num_labels = chunk.len() as c_uint;
        for (params, item) in (*display).text_params.iter_mut().zip(chunk) {
            write_text(params, item);
        }
        ffi::nvds_add_display_meta_to_frame(frame, display);
    }
}

/// Fill text params taken fresh from the pool.
///
/// The pool hands out cleared slots, so string fields are assigned without
/// freeing. The pool frees them on release.
unsafe fn write_text(params: &mut ffi::NvOsdTextParams, item: &DisplayMeta) {
    params.display_text = dup_text(&item.text);
    params.x_offset = item.x_offset;
    params.y_offset = item.y_offset;
    params.font_params.font_name = dup_text(&item.font.name);
    params.font_params.font_size = item.font.size;
    params.font_params.font_color = color_params(item.font.color);
    match item.background {
        Some(bg) => {
            params.set_bg_clr = 1;
            params.text_bg_clr = color_params(bg);
        }
        None => params.set_bg_clr = 0,
    }
}

/// Swap a g_malloc'd string owned by the meta for a copy of `text`.
unsafe fn replace_text(slot: &mut *mut c_char, text: &str) {
    if !slot.is_null() {
        glib::ffi::g_free(*slot as *mut c_void);
    }
    *slot = dup_text(text);
}

unsafe fn dup_text(text: &str) -> *mut c_char {
    let text = CString::new(text.replace('\0', "")).unwrap_or_default();
    glib::ffi::g_strdup(text.as_ptr())
}

unsafe fn owned_text(text: *const c_char) -> String {
    if text.is_null() {
        return String::new();
    }
    CStr::from_ptr(text).to_string_lossy().into_owned()
}

/// Fixed-size label, up to the first NUL.
fn label_text(label: &[c_char; MAX_LABEL_SIZE]) -> String {
    let bytes: Vec<u8> = label
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn color(params: ffi::NvOsdColorParams) -> Rgba {
    Rgba::new(params.red, params.green, params.blue, params.alpha)
}

fn color_params(color: Rgba) -> ffi::NvOsdColorParams {
    ffi::NvOsdColorParams {
        red: color.red,
        green: color.green,
        blue: color.blue,
        alpha: color.alpha,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Annotator;
    use crate::fps::Rate;
    use std::mem::MaybeUninit;

    fn zeroed<T>() -> Box<T> {
        // SAFETY: every field of the meta structs is an integer, a float or
        // a raw pointer, all of which are valid when zeroed.
        unsafe { Box::new(MaybeUninit::<T>::zeroed().assume_init()) }
    }

    fn object(class_id: i32, label: &str, object_id: u64, text: &str) -> Box<ffi::NvDsObjectMeta> {
        let mut object = zeroed::<ffi::NvDsObjectMeta>();
        object.class_id = class_id;
        object.object_id = object_id;
        object.confidence = 0.75;
        object.rect_params.left = 4.0;
        object.rect_params.width = 16.0;
        for (slot, byte) in object.obj_label.iter_mut().zip(label.bytes()) {
            *slot = byte as c_char;
        }
        // SAFETY: replaces a null slot with a g_malloc'd copy.
        unsafe { replace_text(&mut object.text_params.display_text, text) };
        object
    }

    /// Frame meta owning `objects` through a GList, as nvinfer leaves it.
    struct TestFrame {
        frame: Box<ffi::NvDsFrameMeta>,
        objects: Vec<Box<ffi::NvDsObjectMeta>>,
    }

    impl TestFrame {
        fn new(frame_num: i32, mut objects: Vec<Box<ffi::NvDsObjectMeta>>) -> Self {
            let mut frame = zeroed::<ffi::NvDsFrameMeta>();
            frame.frame_num = frame_num;
            for object in &mut objects {
                // SAFETY: the list stores pointers to boxes kept alive by `objects`.
                frame.obj_meta_list = unsafe {
                    glib::ffi::g_list_append(
                        frame.obj_meta_list,
                        object.as_mut() as *mut ffi::NvDsObjectMeta as *mut c_void,
                    )
                };
            }
            Self { frame, objects }
        }

        fn as_ptr(&mut self) -> *mut ffi::NvDsFrameMeta {
            self.frame.as_mut()
        }
    }

    impl Drop for TestFrame {
        fn drop(&mut self) {
            // SAFETY: the list and the strings were allocated with glib above.
            unsafe {
                glib::ffi::g_list_free(self.frame.obj_meta_list);
                for object in &mut self.objects {
                    glib::ffi::g_free(object.text_params.display_text as *mut c_void);
                }
            }
        }
    }

    #[test]
    fn test_read_frame() {
        let mut frame = TestFrame::new(
            42,
            vec![
                object(0, "person", 9, "person 9 0.75"),
                object(2, "car", UNTRACKED_OBJECT_ID, "car"),
            ],
        );

        // SAFETY: the test frame owns every pointer it links.
        let meta = unsafe { read_frame(frame.as_ptr()) };
        assert_eq!(meta.frame_index, 42);
        assert_eq!(meta.objects.len(), 2);
        assert_eq!(meta.objects[0].label, "person");
        assert_eq!(meta.objects[0].tracking_id(), 9);
        assert_eq!(meta.objects[0].display_text(), "person 9 0.75");
        assert_eq!(meta.objects[0].bbox.width, 16.0);
        assert!(!meta.objects[1].is_tracked());
        assert!(meta.display_meta.is_empty());
    }

    #[test]
    fn test_relabel_replaces_display_text_only() {
        let mut frame = TestFrame::new(0, vec![object(0, "person", 9, "person 9 0.75")]);
        // SAFETY: as above.
        let before = unsafe { read_frame(frame.as_ptr()) };

        let mut batch = FrameBatch::new(vec![before.clone()]);
        Annotator::default().annotate(&mut batch, Some(Rate::new(25.0)));
        let edits = FrameEdits::between(&before, &batch.frames[0]);
        // SAFETY: as above.
        unsafe { relabel_objects(frame.as_ptr(), &edits) };

        let object = &frame.objects[0];
        // SAFETY: display_text was just written by `replace_text`.
        assert_eq!(unsafe { owned_text(object.text_params.display_text) }, "person");
        assert_eq!(object.object_id, 9);
        assert_eq!(label_text(&object.obj_label), "person");
    }

    #[test]
    fn test_write_text_params() {
        let mut params = zeroed::<ffi::NvOsdTextParams>();
        let overlay = Annotator::new("rate").rate_overlay(Some(Rate::new(29.97)));
        // SAFETY: the slot is zeroed, as the pool hands it out.
        unsafe { write_text(&mut params, &overlay) };

        // SAFETY: the strings were just written.
        let read = unsafe { read_text(&params) };
        assert_eq!(read, overlay);
        assert_eq!(read.text, "rate: 30.0");
        assert_eq!(params.x_offset, 10);
        assert_eq!(params.y_offset, 12);
        assert_eq!(params.set_bg_clr, 1);

        // SAFETY: both strings came from g_strdup.
        unsafe {
            glib::ffi::g_free(params.display_text as *mut c_void);
            glib::ffi::g_free(params.font_params.font_name as *mut c_void);
        }
    }

    #[test]
    fn test_label_stops_at_nul() {
        let mut label = [0 as c_char; MAX_LABEL_SIZE];
        for (slot, byte) in label.iter_mut().zip(b"bicycle\0junk") {
            *slot = *byte as c_char;
        }
        assert_eq!(label_text(&label), "bicycle");

        let full = [b'a' as c_char; MAX_LABEL_SIZE];
        assert_eq!(label_text(&full).len(), MAX_LABEL_SIZE);
    }
}
