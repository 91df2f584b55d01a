//! GStreamer integration.

pub mod bus;
pub mod caps;
pub mod meta;
#[cfg(feature = "deepstream")]
pub mod nvds;
pub mod pipeline;
pub mod probes;
pub mod properties;

use crate::graph::{ConstructionError, ElementRegistry};
use gstreamer as gst;
use std::sync::Arc;
use thiserror::Error;

pub use meta::{BatchMetaAccess, RoiBatchMeta};
pub use pipeline::{FrameHooks, StreamPipeline};

/// Batch metadata binding of the inference engine this build targets.
pub fn engine_batch_meta() -> Arc<dyn BatchMetaAccess> {
    #[cfg(feature = "deepstream")]
    {
        Arc::new(nvds::DeepStreamBatchMeta)
    }
    #[cfg(not(feature = "deepstream"))]
    {
        Arc::new(RoiBatchMeta)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("GStreamer error: {0}")]
    GStreamer(#[from] gst::glib::Error),

    #[error("GStreamer boolean error: {0}")]
    BoolError(#[from] gst::glib::BoolError),

    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Lifecycle(#[from] crate::graph::lifecycle::LifecycleError),

    #[error("Invalid property value for {element}.{property}: {reason}")]
    InvalidProperty {
        element: String,
        property: String,
        reason: String,
    },

    #[error("Pipeline state change failed: {0}")]
    StateChange(String),
}

/// Factory lookup against the GStreamer plugin registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct GstRegistry;

impl ElementRegistry for GstRegistry {
    fn has_factory(&self, factory: &str) -> bool {
        gst::ElementFactory::find(factory).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        gst::init().unwrap();
        assert!(GstRegistry.has_factory("fakesink"));
        assert!(!GstRegistry.has_factory("nonexistentelement"));
    }
}
