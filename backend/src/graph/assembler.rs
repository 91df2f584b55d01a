//! Static pipeline assembly.
//!
//! [`build`] turns an [`AssemblerConfig`] into a [`PipelineGraph`]: it picks
//! the codec, lays out the stage chain for the source kind, probes every
//! factory, validates required configuration, links all static ports and
//! registers the two per-buffer hooks. Construction is all-or-nothing.

use super::{
    BranchTarget, ConstructionError, HookKind, PipelineGraph, Port, PortRef, Stage,
};
use osdcast_types::{CapsDescriptor, PortPresence, PropertyValue, StageKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

pub const CAMERA_SOURCE: &str = "camera-source";
pub const CAMERA_CAPS: &str = "camera-caps";
pub const CAMERA_CONVERT: &str = "camera-convert";
pub const URI_SOURCE: &str = "uri-source";
pub const NVMM_CONVERT: &str = "nvmm-convert";
pub const NVMM_CAPS: &str = "nvmm-caps";
pub const STREAM_MUX: &str = "stream-mux";
pub const PRIMARY_INFER: &str = "primary-infer";
pub const TRACKER: &str = "tracker";
pub const OSD_CONVERT: &str = "osd-convert";
pub const OSD: &str = "osd";
pub const POST_OSD_CONVERT: &str = "post-osd-convert";
pub const ENCODER_CAPS: &str = "encoder-caps";
pub const ENCODER: &str = "encoder";
pub const PAYLOADER: &str = "payloader";
pub const UDP_SINK: &str = "udp-sink";

/// Mux input the single source is fed into.
pub const MUX_SINK_PAD: &str = "sink_0";

const NVMM_NV12_CAPS: &str = "video/x-raw(memory:NVMM), format=NV12";
const NVMM_I420_CAPS: &str = "video/x-raw(memory:NVMM), format=I420";
const RAW_VIDEO: &str = "video/x-raw";
const RTP: &str = "application/x-rtp";
/// Capture caps left for the device to choose
const UNCONSTRAINED_CAPS: &str = "ANY";

/// Video codec used for encoding and RTP payloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Resolve a codec selector. Only `H264` and `H265` are accepted.
    pub fn select(selector: &str) -> Result<Self, ConstructionError> {
        match selector {
            "H264" => Ok(Codec::H264),
            "H265" => Ok(Codec::H265),
            _ => Err(ConstructionError::new(
                ENCODER,
                format!("unknown codec '{}', expected H264 or H265", selector),
            )),
        }
    }

    pub fn encoder_factory(&self) -> &'static str {
        match self {
            Codec::H264 => "nvv4l2h264enc",
            Codec::H265 => "nvv4l2h265enc",
        }
    }

    pub fn payloader_factory(&self) -> &'static str {
        match self {
            Codec::H264 => "rtph264pay",
            Codec::H265 => "rtph265pay",
        }
    }

    /// RTP encoding name announced in the session description.
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    /// Elementary stream caps between encoder and payloader.
    pub fn bitstream_caps(&self) -> CapsDescriptor {
        match self {
            Codec::H264 => CapsDescriptor::new("video/x-h264"),
            Codec::H265 => CapsDescriptor::new("video/x-h265"),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// How the input identifier is ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Raw capture device with caps known up front
    Camera { device: String },
    /// Decoded media whose stream types appear at runtime
    Uri { uri: String },
}

impl SourceKind {
    /// Anything with a scheme is a URI, everything else a device path.
    pub fn detect(input: &str) -> Self {
        if input.contains("://") {
            SourceKind::Uri {
                uri: input.to_string(),
            }
        } else {
            SourceKind::Camera {
                device: input.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxSettings {
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    /// Microseconds the mux waits to fill a batch
    pub batched_push_timeout: i64,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            batch_size: 1,
            batched_push_timeout: 4_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSettings {
    pub host: String,
    pub port: u16,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            host: osdcast_types::DEFAULT_UDP_HOST.to_string(),
            port: osdcast_types::DEFAULT_UDP_PORT,
        }
    }
}

/// Everything [`build`] needs.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Codec selector, `H264` or `H265`
    pub codec: String,
    pub bitrate: u32,
    /// Device path or URI
    pub input: String,
    /// Inference engine configuration file
    pub infer_config: PathBuf,
    /// Tracker properties; no tracker stage when `None`
    pub tracker: Option<BTreeMap<String, PropertyValue>>,
    /// Caps forced on the capture device, `ANY` by default
    pub camera_caps: String,
    pub mux: MuxSettings,
    pub sink: SinkSettings,
    /// Apply the Jetson encoder properties
    pub jetson: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            codec: "H264".to_string(),
            bitrate: 4_000_000,
            input: String::new(),
            infer_config: PathBuf::from("dstest1_pgie_config.txt"),
            tracker: None,
            camera_caps: UNCONSTRAINED_CAPS.to_string(),
            mux: MuxSettings::default(),
            sink: SinkSettings::default(),
            jetson: cfg!(any(target_arch = "aarch64", feature = "jetson")),
        }
    }
}

/// Answers whether an element factory can be instantiated.
pub trait ElementRegistry {
    fn has_factory(&self, factory: &str) -> bool;
}

impl<F> ElementRegistry for F
where
    F: Fn(&str) -> bool,
{
    fn has_factory(&self, factory: &str) -> bool {
        self(factory)
    }
}

/// Registry that reports every factory as present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeAvailable;

impl ElementRegistry for AssumeAvailable {
    fn has_factory(&self, _factory: &str) -> bool {
        true
    }
}

/// Assemble the static pipeline graph.
pub fn build(
    config: &AssemblerConfig,
    registry: &dyn ElementRegistry,
) -> Result<PipelineGraph, ConstructionError> {
    // Resolved before anything is probed
    let codec = Codec::select(&config.codec)?;

    if config.input.trim().is_empty() {
        return Err(ConstructionError::new("source", "no input source given"));
    }
    let source = SourceKind::detect(&config.input);
    info!("Assembling {} pipeline for {:?}", codec, source);

    let stages = plan_stages(config, codec, &source)?;
    let mut graph = PipelineGraph::new();
    for stage in stages {
        if !registry.has_factory(&stage.factory) {
            return Err(ConstructionError::new(
                &stage.name,
                format!("element factory '{}' is not available", stage.factory),
            ));
        }
        let missing = stage.missing_keys();
        if !missing.is_empty() {
            return Err(ConstructionError::new(
                &stage.name,
                format!("missing required configuration: {}", missing.join(", ")),
            ));
        }
        graph.add_stage(stage)?;
    }

    let mut chain: Vec<&str> = Vec::new();
    match &source {
        SourceKind::Camera { .. } => {
            chain.extend([CAMERA_SOURCE, CAMERA_CAPS, CAMERA_CONVERT, NVMM_CONVERT, NVMM_CAPS]);
            link_chain(&mut graph, &chain)?;
            graph.link(
                &PortRef::new(NVMM_CAPS, "src"),
                &PortRef::new(STREAM_MUX, MUX_SINK_PAD),
            )?;
            chain.clear();
        }
        SourceKind::Uri { .. } => {
            graph.set_dynamic_branch(
                URI_SOURCE,
                vec![
                    BranchTarget::Stage(NVMM_CONVERT.to_string()),
                    BranchTarget::Stage(NVMM_CAPS.to_string()),
                    BranchTarget::Port(PortRef::new(STREAM_MUX, MUX_SINK_PAD)),
                ],
            )?;
        }
    }

    chain.extend([STREAM_MUX, PRIMARY_INFER]);
    if config.tracker.is_some() {
        chain.push(TRACKER);
    }
    chain.extend([
        OSD_CONVERT,
        OSD,
        POST_OSD_CONVERT,
        ENCODER_CAPS,
        ENCODER,
        PAYLOADER,
        UDP_SINK,
    ]);
    link_chain(&mut graph, &chain)?;

    graph.add_hook(HookKind::RateAdvance, PortRef::new(OSD_CONVERT, "src"))?;
    graph.add_hook(HookKind::Annotation, PortRef::new(OSD, "sink"))?;
    check_hook_order(&graph)?;

    info!(
        "Assembled pipeline: {} stages, {} links",
        graph.stages().len(),
        graph.links().len()
    );
    Ok(graph)
}

fn link_chain(graph: &mut PipelineGraph, chain: &[&str]) -> Result<(), ConstructionError> {
    for pair in chain.windows(2) {
        graph.link_stages(pair[0], pair[1])?;
    }
    Ok(())
}

/// The rate hook must see each frame before the annotation hook.
fn check_hook_order(graph: &PipelineGraph) -> Result<(), ConstructionError> {
    let (Some(rate), Some(annotation)) = (
        graph.hook(HookKind::RateAdvance),
        graph.hook(HookKind::Annotation),
    ) else {
        return Err(ConstructionError::new(OSD, "per-buffer hooks not registered"));
    };

    if !graph.reaches(&rate.port.stage, &annotation.port.stage) {
        return Err(ConstructionError::new(
            &annotation.port.stage,
            format!(
                "rate hook at {} is not upstream of annotation hook at {}",
                rate.port, annotation.port
            ),
        ));
    }
    debug!(
        "Hooks ordered: {} before {}",
        rate.port, annotation.port
    );
    Ok(())
}

fn parse_caps(stage: &str, caps: &str) -> Result<CapsDescriptor, ConstructionError> {
    caps.parse()
        .map_err(|e| ConstructionError::new(stage, format!("{}", e)))
}

fn filter_stage(name: &str, caps: &str) -> Result<Stage, ConstructionError> {
    let desc = parse_caps(name, caps)?;
    Ok(Stage::new(name, StageKind::CapabilityFilter, "capsfilter")
        .with_property("caps", caps)
        .with_port(Port::input("sink", Some(desc.clone())))
        .with_port(Port::output("src", Some(desc))))
}

fn passthrough(
    name: &str,
    kind: StageKind,
    factory: &str,
    sink: Option<CapsDescriptor>,
    src: CapsDescriptor,
) -> Stage {
    Stage::new(name, kind, factory)
        .with_port(Port::input("sink", sink))
        .with_port(Port::output("src", Some(src)))
}

/// Stage list in graph order, with configuration applied.
fn plan_stages(
    config: &AssemblerConfig,
    codec: Codec,
    source: &SourceKind,
) -> Result<Vec<Stage>, ConstructionError> {
    let raw = CapsDescriptor::new(RAW_VIDEO);
    let nvmm = CapsDescriptor::new(RAW_VIDEO).with_memory("NVMM");
    let mut stages = Vec::new();

    match source {
        SourceKind::Camera { device } => {
            stages.push(
                Stage::new(CAMERA_SOURCE, StageKind::Source, "v4l2src")
                    .with_property("device", device.as_str())
                    .with_port(Port::output("src", Some(raw.clone()))),
            );
            stages.push(filter_stage(CAMERA_CAPS, &config.camera_caps)?);
            stages.push(passthrough(
                CAMERA_CONVERT,
                StageKind::FormatConvert,
                "videoconvert",
                Some(raw.clone()),
                raw.clone(),
            ));
            stages.push(passthrough(
                NVMM_CONVERT,
                StageKind::Convert,
                "nvvideoconvert",
                Some(raw.clone()),
                raw.clone(),
            ));
        }
        SourceKind::Uri { uri } => {
            stages.push(
                Stage::new(URI_SOURCE, StageKind::Source, "uridecodebin")
                    .with_property("uri", uri.as_str())
                    .with_dynamic_outputs(),
            );
            // Input caps are unknown until the decoder exposes its stream
            stages.push(passthrough(
                NVMM_CONVERT,
                StageKind::Convert,
                "nvvideoconvert",
                None,
                raw.clone(),
            ));
        }
    }
    stages.push(filter_stage(NVMM_CAPS, NVMM_NV12_CAPS)?);

    stages.push(
        Stage::new(STREAM_MUX, StageKind::Mux, "nvstreammux")
            .with_property("width", config.mux.width)
            .with_property("height", config.mux.height)
            .with_property("batch-size", config.mux.batch_size)
            .with_property("batched-push-timeout", config.mux.batched_push_timeout)
            .with_port(
                Port::input(MUX_SINK_PAD, Some(nvmm.clone())).with_presence(PortPresence::Request),
            )
            .with_port(Port::output("src", Some(nvmm.clone()))),
    );

    stages.push(
        passthrough(
            PRIMARY_INFER,
            StageKind::Inference,
            "nvinfer",
            Some(nvmm.clone()),
            nvmm.clone(),
        )
        .with_property("config-file-path", config.infer_config.display().to_string()),
    );

    if let Some(properties) = &config.tracker {
        let mut tracker = passthrough(
            TRACKER,
            StageKind::Tracker,
            "nvtracker",
            Some(nvmm.clone()),
            nvmm.clone(),
        );
        tracker.properties.extend(properties.clone());
        stages.push(tracker);
    }

    stages.push(passthrough(
        OSD_CONVERT,
        StageKind::Convert,
        "nvvideoconvert",
        Some(raw.clone()),
        raw.clone(),
    ));
    stages.push(passthrough(
        OSD,
        StageKind::OverlayCompositor,
        "nvdsosd",
        Some(nvmm.clone()),
        nvmm.clone(),
    ));
    stages.push(passthrough(
        POST_OSD_CONVERT,
        StageKind::FormatConvertPost,
        "nvvideoconvert",
        Some(raw.clone()),
        raw,
    ));
    stages.push(filter_stage(ENCODER_CAPS, NVMM_I420_CAPS)?);

    let mut encoder = passthrough(
        ENCODER,
        StageKind::Encoder,
        codec.encoder_factory(),
        Some(nvmm),
        codec.bitstream_caps(),
    )
    .with_property("bitrate", config.bitrate);
    if config.jetson {
        encoder = encoder
            .with_property("preset-level", 1u32)
            .with_property("insert-sps-pps", true)
            .with_property("bufapi-version", true);
    }
    stages.push(encoder);

    stages.push(passthrough(
        PAYLOADER,
        StageKind::Payloader,
        codec.payloader_factory(),
        Some(codec.bitstream_caps()),
        CapsDescriptor::new(RTP),
    ));

    stages.push(
        Stage::new(UDP_SINK, StageKind::Sink, "udpsink")
            .with_property("host", config.sink.host.as_str())
            .with_property("port", config.sink.port as i64)
            .with_property("async", false)
            .with_property("sync", true)
            .with_port(Port::input("sink", Some(CapsDescriptor::any()))),
    );

    Ok(stages)
}
