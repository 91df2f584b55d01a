//! Realization of a [`PipelineGraph`] as a GStreamer pipeline.

use super::caps::pad_descriptor;
use super::properties::set_property;
use super::{bus, probes, BatchMetaAccess, PipelineError};
use crate::annotate::{Annotator, StreamContext};
use crate::graph::{
    ConstructionError, DiscoveredPort, Discovery, HookKind, Link, PipelineGraph, PortRef,
    StreamListener, TopologyResolver,
};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use osdcast_types::{PipelineState, PortPresence};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State the per-buffer hooks share.
#[derive(Clone)]
pub struct FrameHooks {
    pub context: Arc<Mutex<StreamContext>>,
    pub meta: Arc<dyn BatchMetaAccess>,
}

impl FrameHooks {
    /// Hooks for one stream, reading batches through `meta`.
    pub fn new(
        stream_id: u32,
        annotator: Annotator,
        meta: Arc<dyn BatchMetaAccess>,
    ) -> Self {
        Self {
            context: Arc::new(Mutex::new(StreamContext::new(stream_id, annotator))),
            meta,
        }
    }
}

/// A realized pipeline and the graph it was built from.
pub struct StreamPipeline {
    pipeline: gst::Pipeline,
    graph: Arc<Mutex<PipelineGraph>>,
    bus_watch: Option<glib::SignalHandlerId>,
}

impl StreamPipeline {
    /// Create, configure and link one element per stage.
    ///
    /// Any failure names the stage it happened on.
    pub fn realize(graph: PipelineGraph, hooks: FrameHooks) -> Result<Self, PipelineError> {
        info!(
            "Realizing pipeline: {} stages, {} links",
            graph.stages().len(),
            graph.links().len()
        );

        let pipeline = gst::Pipeline::builder().name("osdcast").build();
        let mut elements = HashMap::new();

        for stage in graph.stages() {
            debug!("Creating element {} (factory: {})", stage.name, stage.factory);
            let element = gst::ElementFactory::make(&stage.factory)
                .name(&stage.name)
                .build()
                .map_err(|e| {
                    error!("Failed to create element {}: {}", stage.name, e);
                    ConstructionError::new(
                        &stage.name,
                        format!("failed to create '{}': {}", stage.factory, e),
                    )
                })?;

            for (key, value) in &stage.properties {
                set_property(&element, &stage.name, key, value)
                    .map_err(|e| ConstructionError::new(&stage.name, e.to_string()))?;
            }

            pipeline.add(&element).map_err(|e| {
                ConstructionError::new(&stage.name, format!("failed to add to pipeline: {}", e))
            })?;
            elements.insert(stage.name.clone(), element);
        }

        for link in graph.links() {
            link_pads(&elements, &graph, link)?;
        }

        for hook in graph.hooks() {
            let pad = pad_for(&elements, &graph, &hook.port)?;
            let attached = match hook.kind {
                HookKind::RateAdvance => probes::attach_rate_probe(&pad, hooks.context.clone()),
                HookKind::Annotation => probes::attach_annotation_probe(
                    &pad,
                    hooks.context.clone(),
                    hooks.meta.clone(),
                ),
            };
            if attached.is_none() {
                return Err(ConstructionError::new(
                    &hook.port.stage,
                    format!("failed to attach {:?} hook on {}", hook.kind, hook.port),
                )
                .into());
            }
        }

        let graph = Arc::new(Mutex::new(graph));
        connect_dynamic_branch(&elements, &graph, TopologyResolver::new())?;

        Ok(Self {
            pipeline,
            graph,
            bus_watch: None,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.graph.lock().state()
    }

    /// Route bus notifications into the lifecycle and quit `main_loop` on
    /// end-of-stream or error.
    pub fn watch_bus(&mut self, main_loop: glib::MainLoop) -> Result<(), PipelineError> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| PipelineError::StateChange("pipeline has no bus".to_string()))?;
        if let Some(handler) = self.bus_watch.take() {
            bus::unwatch(&bus, handler);
        }
        self.bus_watch = Some(bus::watch(&bus, self.graph.clone(), main_loop));
        Ok(())
    }

    /// `Built -> Running`, then set the pipeline to PLAYING.
    pub fn start(&mut self) -> Result<PipelineState, PipelineError> {
        let state = self.graph.lock().start()?;

        info!("Setting pipeline to PLAYING");
        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            self.graph.lock().fail();
            return Err(PipelineError::StateChange(format!(
                "Failed to reach PLAYING: {}",
                e
            )));
        }
        Ok(state)
    }

    /// Set the pipeline to NULL and stop the lifecycle.
    pub fn stop(&mut self) -> Result<PipelineState, PipelineError> {
        info!("Stopping pipeline");
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| PipelineError::StateChange(format!("Failed to stop: {}", e)))?;

        if let (Some(handler), Some(bus)) = (self.bus_watch.take(), self.pipeline.bus()) {
            bus::unwatch(&bus, handler);
        }

        let mut graph = self.graph.lock();
        match graph.state() {
            PipelineState::Built => Ok(PipelineState::Built),
            _ => Ok(graph.stop()?),
        }
    }

    /// DOT graph of the realized pipeline.
    pub fn dot_graph(&self) -> String {
        self.pipeline
            .debug_to_dot_data(gst::DebugGraphDetails::all())
            .to_string()
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Pad backing a model port, requesting it when the port is a request port.
fn pad_for(
    elements: &HashMap<String, gst::Element>,
    graph: &PipelineGraph,
    port: &PortRef,
) -> Result<gst::Pad, ConstructionError> {
    let element = elements
        .get(&port.stage)
        .ok_or_else(|| ConstructionError::new(&port.stage, "element not realized"))?;
    let presence = graph
        .port(port)
        .map(|p| p.presence)
        .unwrap_or(PortPresence::Always);

    let pad = match presence {
        PortPresence::Request => element.request_pad_simple(&port.port),
        _ => element.static_pad(&port.port),
    };
    pad.ok_or_else(|| ConstructionError::new(&port.stage, format!("no pad {}", port)))
}

fn link_pads(
    elements: &HashMap<String, gst::Element>,
    graph: &PipelineGraph,
    link: &Link,
) -> Result<(), ConstructionError> {
    let src = pad_for(elements, graph, &link.from)?;
    let sink = pad_for(elements, graph, &link.to)?;
    src.link(&sink).map_err(|e| {
        error!("Failed to link {} -> {}: {:?}", link.from, link.to, e);
        ConstructionError::new(
            &link.to.stage,
            format!("failed to link {} -> {}: {:?}", link.from, link.to, e),
        )
    })?;
    debug!("Linked {} -> {}", link.from, link.to);
    Ok(())
}

/// Complete the dynamic branch when its source exposes a video pad.
fn connect_dynamic_branch(
    elements: &HashMap<String, gst::Element>,
    graph: &Arc<Mutex<PipelineGraph>>,
    resolver: TopologyResolver,
) -> Result<(), ConstructionError> {
    let Some(branch) = graph.lock().dynamic_branch().cloned() else {
        return Ok(());
    };
    let source = elements
        .get(&branch.source)
        .ok_or_else(|| ConstructionError::new(&branch.source, "element not realized"))?;

    info!("Waiting for streams on {}", branch.source);
    let elements = elements.clone();
    let graph = graph.clone();

    source.connect_pad_added(move |element, pad| {
        if pad.direction() != gst::PadDirection::Src {
            return;
        }

        let candidate = DiscoveredPort {
            port: PortRef::new(&branch.source, pad.name().as_str()),
            caps: pad_descriptor(pad),
        };
        match resolver.on_stream_discovered(candidate, &branch.targets) {
            Ok(Discovery::Queued) => {}
            Ok(outcome) => {
                debug!("Pad {} not linked: {:?}", pad.name(), outcome);
                return;
            }
            Err(e) => {
                warn!("Dropping stream: {}", e);
                return;
            }
        }

        let mut graph = graph.lock();
        let result = resolver.drain(&mut graph).and_then(|links| {
            links
                .iter()
                .try_for_each(|link| link_pads(&elements, &graph, link))
        });
        if let Err(e) = result {
            graph.fail();
            gst::element_error!(element, gst::CoreError::Negotiation, ("{}", e));
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gst::RoiBatchMeta;
    use crate::graph::assembler::{build, AssemblerConfig, AssumeAvailable};
    use crate::graph::{Port, Stage};
    use osdcast_types::{CapsDescriptor, StageKind};

    fn roi_hooks() -> FrameHooks {
        FrameHooks::new(0, Annotator::default(), Arc::new(RoiBatchMeta))
    }

    fn camera_graph() -> PipelineGraph {
        let config = AssemblerConfig {
            input: "/dev/video0".to_string(),
            ..Default::default()
        };
        build(&config, &AssumeAvailable).unwrap()
    }

    /// videotestsrc -> capsfilter -> fakesink with both hooks attached.
    fn test_graph(num_buffers: i64) -> PipelineGraph {
        let raw = Some(CapsDescriptor::new("video/x-raw"));
        let mut graph = PipelineGraph::new();
        graph
            .add_stage(
                Stage::new("source", StageKind::Source, "videotestsrc")
                    .with_property("num-buffers", num_buffers)
                    .with_port(Port::output("src", raw.clone())),
            )
            .unwrap();
        graph
            .add_stage(
                Stage::new("filter", StageKind::CapabilityFilter, "capsfilter")
                    .with_property("caps", "video/x-raw, width=320, height=240")
                    .with_port(Port::input("sink", raw.clone()))
                    .with_port(Port::output("src", raw)),
            )
            .unwrap();
        graph
            .add_stage(
                Stage::new("sink", StageKind::Sink, "fakesink")
                    .with_property("sync", false)
                    .with_port(Port::input("sink", Some(CapsDescriptor::any()))),
            )
            .unwrap();
        graph.link_stages("source", "filter").unwrap();
        graph.link_stages("filter", "sink").unwrap();
        graph
            .add_hook(HookKind::RateAdvance, PortRef::new("filter", "src"))
            .unwrap();
        graph
            .add_hook(HookKind::Annotation, PortRef::new("sink", "sink"))
            .unwrap();
        graph
    }

    #[test]
    fn test_missing_factory_names_stage() {
        gst::init().unwrap();
        let graph = camera_graph();
        let expected = graph
            .stages()
            .iter()
            .find(|s| gst::ElementFactory::find(&s.factory).is_none())
            .map(|s| s.name.clone());

        match StreamPipeline::realize(graph, roi_hooks()) {
            Err(PipelineError::Construction(e)) => assert_eq!(Some(e.stage_name), expected),
            Ok(_) => assert!(expected.is_none()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_invalid_property_names_stage() {
        gst::init().unwrap();
        let mut graph = PipelineGraph::new();
        graph
            .add_stage(
                Stage::new("sink", StageKind::Sink, "fakesink")
                    .with_property("no-such-property", 1i64)
                    .with_port(Port::input("sink", Some(CapsDescriptor::any()))),
            )
            .unwrap();

        let err = StreamPipeline::realize(graph, roi_hooks()).err().unwrap();
        match err {
            PipelineError::Construction(e) => assert_eq!(e.stage_name, "sink"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_runs_to_end_of_stream() {
        gst::init().unwrap();
        let hooks = roi_hooks();
        let context = hooks.context.clone();
        let mut pipeline = StreamPipeline::realize(test_graph(5), hooks).unwrap();

        let main_loop = glib::MainLoop::new(None, false);
        pipeline.watch_bus(main_loop.clone()).unwrap();
        assert_eq!(pipeline.start().unwrap(), PipelineState::Running);

        let timeout = main_loop.clone();
        glib::timeout_add_seconds_once(10, move || timeout.quit());
        main_loop.run();

        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(context.lock().monitor().window().frame_count(), 5);
        assert!(pipeline.dot_graph().contains("digraph"));
        assert_eq!(pipeline.stop().unwrap(), PipelineState::Stopped);
    }

    #[test]
    fn test_start_twice_rejected() {
        gst::init().unwrap();
        let mut pipeline = StreamPipeline::realize(test_graph(1), roi_hooks()).unwrap();
        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(PipelineError::Lifecycle(_))));
        pipeline.stop().unwrap();
    }
}
