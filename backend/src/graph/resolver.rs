//! Completion of the dynamic decode branch.
//!
//! A URI source only exposes its output ports once it has inspected the
//! media. Those notifications arrive on a source-internal thread. The
//! resolver claims each candidate port at most once and posts a link request
//! on a channel; whoever owns the graph drains the channel and performs the
//! linking.

use super::{BranchTarget, ConstructionError, Link, NegotiationError, PipelineGraph, PortRef};
use osdcast_types::{CapsDescriptor, MediaKind};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, error, info};

/// A port the source exposed at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPort {
    pub port: PortRef,
    /// Negotiated caps, `None` if the source has not settled them
    pub caps: Option<CapsDescriptor>,
}

/// Outcome of a discovery notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// A link request was posted
    Queued,
    /// Not a video stream; left unlinked
    IgnoredNonVideo,
    /// The port was already claimed by an earlier notification
    AlreadyClaimed,
}

/// Receives stream discovery notifications from a dynamic source.
pub trait StreamListener: Send + Sync {
    fn on_stream_discovered(
        &self,
        candidate: DiscoveredPort,
        targets: &[BranchTarget],
    ) -> Result<Discovery, NegotiationError>;
}

#[derive(Debug)]
struct LinkRequest {
    candidate: PortRef,
    caps: CapsDescriptor,
    targets: Vec<BranchTarget>,
}

pub struct TopologyResolver {
    sender: Sender<LinkRequest>,
    receiver: Mutex<Receiver<LinkRequest>>,
    claimed: Mutex<HashSet<PortRef>>,
}

impl Default for TopologyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyResolver {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Perform all posted link requests on the graph.
    ///
    /// Returns the links added, in order. A branch that cannot reach a free
    /// input fails the pipeline.
    pub fn drain(&self, graph: &mut PipelineGraph) -> Result<Vec<Link>, ConstructionError> {
        let receiver = self.receiver.lock();
        let mut added = Vec::new();

        while let Ok(request) = receiver.try_recv() {
            match complete_branch(graph, &request) {
                Ok(links) => added.extend(links),
                Err(e) => {
                    error!("Failed to complete branch from {}: {}", request.candidate, e);
                    graph.fail();
                    return Err(e);
                }
            }
        }

        if !added.is_empty() {
            graph.settle_dynamic_branch();
        }
        Ok(added)
    }
}

impl StreamListener for TopologyResolver {
    fn on_stream_discovered(
        &self,
        candidate: DiscoveredPort,
        targets: &[BranchTarget],
    ) -> Result<Discovery, NegotiationError> {
        let Some(caps) = candidate.caps else {
            return Err(NegotiationError {
                port: candidate.port,
                reason: "no caps negotiated".to_string(),
            });
        };

        if caps.kind() != MediaKind::Video {
            info!(
                "Ignoring non-video stream {} ({})",
                candidate.port, caps.media_type
            );
            return Ok(Discovery::IgnoredNonVideo);
        }

        if !self.claimed.lock().insert(candidate.port.clone()) {
            debug!("Port {} already claimed", candidate.port);
            return Ok(Discovery::AlreadyClaimed);
        }

        info!("Discovered video stream on {} ({})", candidate.port, caps);
        let request = LinkRequest {
            candidate: candidate.port.clone(),
            caps,
            targets: targets.to_vec(),
        };
        self.sender.send(request).map_err(|_| NegotiationError {
            port: candidate.port,
            reason: "resolver channel closed".to_string(),
        })?;
        Ok(Discovery::Queued)
    }
}

fn input_of(target: &BranchTarget) -> PortRef {
    match target {
        BranchTarget::Stage(name) => PortRef::new(name, "sink"),
        BranchTarget::Port(port) => port.clone(),
    }
}

fn stage_of(target: &BranchTarget) -> &str {
    match target {
        BranchTarget::Stage(name) => name,
        BranchTarget::Port(port) => &port.stage,
    }
}

/// Link the candidate to the first free target input, then chain onward.
fn complete_branch(
    graph: &mut PipelineGraph,
    request: &LinkRequest,
) -> Result<Vec<Link>, ConstructionError> {
    let candidate = graph.add_dynamic_port(&request.candidate, request.caps.clone())?;

    let start = request
        .targets
        .iter()
        .position(|t| !graph.is_linked(&input_of(t)))
        .ok_or_else(|| {
            let stage = request.targets.last().map(stage_of).unwrap_or("branch");
            ConstructionError::new(stage, format!("no free input for {}", candidate))
        })?;

    let mut links = Vec::new();
    let mut upstream = candidate;
    for target in &request.targets[start..] {
        let link = graph.link(&upstream, &input_of(target))?.clone();
        links.push(link);
        match target {
            BranchTarget::Stage(name) => upstream = PortRef::new(name, "src"),
            BranchTarget::Port(_) => break,
        }
    }
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::assembler::{
        build, AssemblerConfig, AssumeAvailable, MUX_SINK_PAD, NVMM_CONVERT, STREAM_MUX,
        URI_SOURCE,
    };
    use osdcast_types::PipelineState;

    fn uri_graph() -> PipelineGraph {
        let config = AssemblerConfig {
            input: "file:///media/sample_720p.h264".to_string(),
            ..Default::default()
        };
        build(&config, &AssumeAvailable).unwrap()
    }

    fn targets(graph: &PipelineGraph) -> Vec<BranchTarget> {
        graph.dynamic_branch().unwrap().targets.clone()
    }

    fn video(pad: &str) -> DiscoveredPort {
        DiscoveredPort {
            port: PortRef::new(URI_SOURCE, pad),
            caps: Some("video/x-raw(memory:NVMM), format=NV12".parse().unwrap()),
        }
    }

    #[test]
    fn test_video_port_links_branch() {
        let mut graph = uri_graph();
        let resolver = TopologyResolver::new();
        let targets = targets(&graph);

        let outcome = resolver.on_stream_discovered(video("src_0"), &targets).unwrap();
        assert_eq!(outcome, Discovery::Queued);

        let links = resolver.drain(&mut graph).unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].from, PortRef::new(URI_SOURCE, "src_0"));
        assert_eq!(links[2].to, PortRef::new(STREAM_MUX, MUX_SINK_PAD));
        assert!(graph.dynamic_branch().unwrap().resolved);
        assert!(graph.is_fully_linked());
    }

    #[test]
    fn test_unresolved_input_adopts_discovered_caps() {
        let mut graph = uri_graph();
        let resolver = TopologyResolver::new();
        assert!(graph
            .port(&PortRef::new(NVMM_CONVERT, "sink"))
            .unwrap()
            .caps
            .is_none());

        resolver
            .on_stream_discovered(video("src_0"), &targets(&graph))
            .unwrap();
        resolver.drain(&mut graph).unwrap();

        let caps = graph
            .port(&PortRef::new(NVMM_CONVERT, "sink"))
            .unwrap()
            .caps
            .clone()
            .unwrap();
        assert_eq!(caps.format.as_deref(), Some("NV12"));
    }

    #[test]
    fn test_repeated_candidate_is_noop() {
        let mut graph = uri_graph();
        let resolver = TopologyResolver::new();
        let targets = targets(&graph);

        resolver.on_stream_discovered(video("src_0"), &targets).unwrap();
        let second = resolver.on_stream_discovered(video("src_0"), &targets).unwrap();
        assert_eq!(second, Discovery::AlreadyClaimed);

        resolver.drain(&mut graph).unwrap();
        let before = graph.links().len();
        assert!(resolver.drain(&mut graph).unwrap().is_empty());
        assert_eq!(graph.links().len(), before);
    }

    #[test]
    fn test_non_video_left_unlinked() {
        let mut graph = uri_graph();
        let resolver = TopologyResolver::new();
        let audio = DiscoveredPort {
            port: PortRef::new(URI_SOURCE, "src_1"),
            caps: Some("audio/x-raw, format=S16LE".parse().unwrap()),
        };

        let outcome = resolver.on_stream_discovered(audio, &targets(&graph)).unwrap();
        assert_eq!(outcome, Discovery::IgnoredNonVideo);
        assert!(resolver.drain(&mut graph).unwrap().is_empty());
        assert!(graph.stage(URI_SOURCE).unwrap().ports.is_empty());
    }

    #[test]
    fn test_missing_caps_is_negotiation_error() {
        let graph = uri_graph();
        let resolver = TopologyResolver::new();
        let candidate = DiscoveredPort {
            port: PortRef::new(URI_SOURCE, "src_0"),
            caps: None,
        };

        let err = resolver
            .on_stream_discovered(candidate, &targets(&graph))
            .unwrap_err();
        assert_eq!(err.port, PortRef::new(URI_SOURCE, "src_0"));
    }

    #[test]
    fn test_second_video_stream_finds_no_free_input() {
        let mut graph = uri_graph();
        let resolver = TopologyResolver::new();
        let targets = targets(&graph);

        resolver.on_stream_discovered(video("src_0"), &targets).unwrap();
        resolver.drain(&mut graph).unwrap();

        resolver.on_stream_discovered(video("src_1"), &targets).unwrap();
        let err = resolver.drain(&mut graph).unwrap_err();
        assert_eq!(err.stage_name, STREAM_MUX);
        assert_eq!(graph.state(), PipelineState::Failed);
    }

    #[test]
    fn test_links_while_running() {
        let mut graph = uri_graph();
        graph.start().unwrap();

        let resolver = TopologyResolver::new();
        resolver
            .on_stream_discovered(video("src_0"), &targets(&graph))
            .unwrap();
        assert_eq!(resolver.drain(&mut graph).unwrap().len(), 3);
        assert_eq!(graph.state(), PipelineState::Running);
    }
}
