//! Shared types for the osdcast detection pipeline.
//!
//! This crate contains the graph, metadata and notification models shared
//! between the pipeline library and its binary.

/// RTSP port the annotated stream is served on.
pub const DEFAULT_RTSP_PORT: u16 = 8555;

/// Mount path of the annotated stream.
pub const DEFAULT_MOUNT_PATH: &str = "/ds-test";

/// Multicast group the pipeline sends RTP to.
pub const DEFAULT_UDP_HOST: &str = "224.224.255.255";

/// UDP port the pipeline sends RTP to and the RTSP factory reads from.
pub const DEFAULT_UDP_PORT: u16 = 5400;

pub mod caps;
pub mod events;
pub mod meta;
pub mod stage;
pub mod state;

// Re-export commonly used types
pub use caps::{CapsDescriptor, CapsParseError, MediaKind};
pub use events::RuntimeNotification;
pub use meta::{
    BBox, DisplayMeta, FontDescriptor, FrameBatch, FrameMeta, ObjectMeta, Rgba,
    UNTRACKED_OBJECT_ID,
};
pub use stage::{PortDirection, PortPresence, PropertyValue, StageKind};
pub use state::PipelineState;
