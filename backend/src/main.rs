//! osdcast: detection pipeline with on-screen annotations, served over RTSP.

use anyhow::{bail, Context};
use clap::Parser;
use gstreamer::glib;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use osdcast::annotate::Annotator;
use osdcast::config::{CliOverrides, Config};
use osdcast::graph::{assembler::AssumeAvailable, build, Codec};
use osdcast::gst::{engine_batch_meta, FrameHooks, GstRegistry, StreamPipeline};
use osdcast::publisher::{RtspPublisher, StreamPublisher};
use osdcast::tracker_config::TrackerConfig;
use osdcast_types::PipelineState;

/// osdcast - annotated detection pipeline published over RTSP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Camera device path (e.g. /dev/video0) or media URI (e.g. file:///path/to/video.h264)
    #[arg(short, long, env = "OSDCAST_INPUT")]
    input: Option<String>,

    /// Encoder codec: H264 or H265
    #[arg(short, long, env = "OSDCAST_CODEC", value_parser = ["H264", "H265"])]
    codec: Option<String>,

    /// Encoder bitrate in bits per second
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Inference engine configuration file
    #[arg(long)]
    infer_config: Option<PathBuf>,

    /// Tracker configuration file; no tracker stage when omitted
    #[arg(long)]
    tracker_config: Option<PathBuf>,

    /// RTSP server port
    #[arg(long)]
    rtsp_port: Option<u16>,

    /// Print the assembled pipeline graph as JSON and exit
    #[arg(long)]
    print_graph: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_figment(&CliOverrides {
        input: args.input,
        codec: args.codec,
        bitrate: args.bitrate,
        infer_config: args.infer_config,
        tracker_config: args.tracker_config,
        rtsp_port: args.rtsp_port,
    })?;

    // Held until exit so buffered file logs are flushed
    let _log_guard = init_logging(&config)?;
    info!("Configuration loaded");

    let tracker = match &config.tracker_config {
        Some(path) => Some(TrackerConfig::load(path)?.properties),
        None => None,
    };
    let assembler_config = config.assembler_config(tracker);

    if args.print_graph {
        let graph = build(&assembler_config, &AssumeAvailable)?;
        println!("{}", graph.to_json()?);
        return Ok(());
    }

    gstreamer::init()?;
    info!("GStreamer initialized");

    let graph = build(&assembler_config, &GstRegistry)?;
    let codec = Codec::select(&assembler_config.codec)?;

    #[cfg(not(feature = "deepstream"))]
    warn!("Built without the deepstream feature: annotations go to ROI metas, which nvdsosd does not draw");
    let hooks = FrameHooks::new(
        0,
        Annotator::new(config.overlay_label.as_str()),
        engine_batch_meta(),
    );
    let mut pipeline = StreamPipeline::realize(graph, hooks)?;

    let main_loop = glib::MainLoop::new(None, false);
    pipeline.watch_bus(main_loop.clone())?;
    pipeline.start()?;

    let mut publisher = RtspPublisher::new();
    publisher.publish(&config.session_description(codec), pipeline.state())?;

    spawn_ctrl_c_handler(main_loop.clone());
    main_loop.run();

    let final_state = pipeline.state();
    pipeline.stop()?;
    if final_state == PipelineState::Failed {
        bail!("Pipeline failed");
    }
    info!("Pipeline stopped");
    Ok(())
}

/// Console logging plus an optional non-blocking log file.
fn init_logging(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    // Configured level wins over RUST_LOG, which wins over the default
    let filter = match &config.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Quit the main loop on Ctrl+C.
fn spawn_ctrl_c_handler(main_loop: glib::MainLoop) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to start signal runtime: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    main_loop.quit();
                }
                Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    });
}
