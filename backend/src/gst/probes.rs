//! Buffer probes realizing the rate and annotation hooks.

use super::BatchMetaAccess;
use crate::annotate::StreamContext;
use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Count every buffer leaving `pad` in the stream's rate monitor.
pub fn attach_rate_probe(
    pad: &gst::Pad,
    context: Arc<Mutex<StreamContext>>,
) -> Option<gst::PadProbeId> {
    debug!("Attaching rate probe to {}", pad.name());
    pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
        if let Some(gst::PadProbeData::Buffer(_)) = &info.data {
            context.lock().on_rate_boundary(Instant::now());
        }
        gst::PadProbeReturn::Ok
    })
}

/// Annotate the batch of every buffer entering `pad`.
pub fn attach_annotation_probe(
    pad: &gst::Pad,
    context: Arc<Mutex<StreamContext>>,
    meta: Arc<dyn BatchMetaAccess>,
) -> Option<gst::PadProbeId> {
    debug!("Attaching annotation probe to {}", pad.name());
    pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
        if let Some(gst::PadProbeData::Buffer(ref mut buffer)) = info.data {
            let now = Instant::now();
            let buffer = buffer.make_mut();
            let mut context = context.lock();
            let present = meta.with_batch_mut(buffer, &mut |batch| {
                context.on_annotation_boundary(batch, now)
            });
            if !present {
                // Keep the frame accounting in step without metadata
                context.annotation_rate(now);
            }
        }
        gst::PadProbeReturn::Ok
    })
}
