//! RTSP publication of the encoded stream.
//!
//! The pipeline sends RTP to a UDP multicast group. The RTSP server mounts a
//! shared media factory that reads that group back, so every viewer shares a
//! single receiving pipeline.

use crate::graph::Codec;
use gstreamer_rtsp_server as gst_rtsp_server;
use gst_rtsp_server::prelude::*;
use gstreamer::glib;
use osdcast_types::PipelineState;
use thiserror::Error;
use tracing::info;

/// Kernel receive buffer of the factory's UDP source.
const UDP_BUFFER_SIZE: u32 = 524_288;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Refusing to publish a pipeline in state {0}")]
    NotPublishable(PipelineState),

    #[error("RTSP server has no mount points")]
    NoMountPoints,

    #[error("Failed to attach RTSP server: {0}")]
    Attach(#[from] glib::BoolError),
}

/// How a viewer reaches the published stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub rtsp_port: u16,
    pub mount_path: String,
    /// Port the pipeline's UDP sink sends to
    pub udp_port: u16,
    pub codec: Codec,
}

impl SessionDescription {
    pub fn new(codec: Codec) -> Self {
        Self {
            rtsp_port: osdcast_types::DEFAULT_RTSP_PORT,
            mount_path: osdcast_types::DEFAULT_MOUNT_PATH.to_string(),
            udp_port: osdcast_types::DEFAULT_UDP_PORT,
            codec,
        }
    }

    /// Launch line of the media factory.
    pub fn launch_line(&self) -> String {
        format!(
            "( udpsrc name=pay0 port={} buffer-size={} caps=\"application/x-rtp, media=video, clock-rate=90000, encoding-name=(string){}, payload=96 \" )",
            self.udp_port,
            UDP_BUFFER_SIZE,
            self.codec.encoding_name()
        )
    }

    pub fn url(&self) -> String {
        format!("rtsp://localhost:{}{}", self.rtsp_port, self.mount_path)
    }
}

/// Exposes a running pipeline as a network stream.
pub trait StreamPublisher {
    /// Start serving `session`. Returns the viewer URL.
    fn publish(
        &mut self,
        session: &SessionDescription,
        state: PipelineState,
    ) -> Result<String, PublishError>;
}

/// Publisher backed by the GStreamer RTSP server, served from the default
/// main context.
#[derive(Default)]
pub struct RtspPublisher {
    server: Option<gst_rtsp_server::RTSPServer>,
    source: Option<glib::SourceId>,
}

impl RtspPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_serving(&self) -> bool {
        self.source.is_some()
    }
}

impl StreamPublisher for RtspPublisher {
    fn publish(
        &mut self,
        session: &SessionDescription,
        state: PipelineState,
    ) -> Result<String, PublishError> {
        if state != PipelineState::Running {
            return Err(PublishError::NotPublishable(state));
        }

        let server = gst_rtsp_server::RTSPServer::new();
        server.set_service(&session.rtsp_port.to_string());

        let mounts = server.mount_points().ok_or(PublishError::NoMountPoints)?;
        let factory = gst_rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(&session.launch_line());
        factory.set_shared(true);
        mounts.add_factory(&session.mount_path, factory);

        let source = server.attach(None)?;
        let url = session.url();
        info!("*** RTSP stream ready at {} ***", url);

        self.server = Some(server);
        self.source = Some(source);
        Ok(url)
    }
}

impl Drop for RtspPublisher {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            source.remove();
        }
    }
}
