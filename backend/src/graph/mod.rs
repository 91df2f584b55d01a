//! Pipeline graph model.
//!
//! A [`PipelineGraph`] is a DAG of [`Stage`]s joined by [`Link`]s between
//! named ports. Every port carries at most one link. The graph owns its stages
//! and its [`Lifecycle`]; once running, stages can no longer change and only
//! the pending dynamic branch may still be linked.

pub mod assembler;
pub mod lifecycle;
pub mod resolver;

use lifecycle::{Lifecycle, LifecycleError};
use osdcast_types::{
    CapsDescriptor, PipelineState, PortDirection, PortPresence, PropertyValue, StageKind,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

pub use assembler::{build, AssemblerConfig, Codec, ElementRegistry, SourceKind};
pub use resolver::{DiscoveredPort, Discovery, StreamListener, TopologyResolver};

/// A stage could not be created, configured or linked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to construct stage '{stage_name}': {reason}")]
pub struct ConstructionError {
    pub stage_name: String,
    pub reason: String,
}

impl ConstructionError {
    pub fn new(stage_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            reason: reason.into(),
        }
    }
}

/// A dynamically typed port never produced usable caps.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Negotiation failed on {port}: {reason}")]
pub struct NegotiationError {
    pub port: PortRef,
    pub reason: String,
}

/// `stage:port` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortRef {
    pub stage: String,
    pub port: String,
}

impl PortRef {
    pub fn new(stage: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Port {
    pub name: String,
    pub direction: PortDirection,
    pub presence: PortPresence,
    /// `None` until negotiation resolves it
    pub caps: Option<CapsDescriptor>,
}

impl Port {
    pub fn input(name: impl Into<String>, caps: Option<CapsDescriptor>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Input,
            presence: PortPresence::Always,
            caps,
        }
    }

    pub fn output(name: impl Into<String>, caps: Option<CapsDescriptor>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Output,
            presence: PortPresence::Always,
            caps,
        }
    }

    pub fn with_presence(mut self, presence: PortPresence) -> Self {
        self.presence = presence;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    /// Element factory realizing the stage
    pub factory: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub ports: Vec<Port>,
    /// Output ports only appear once the stream type is known
    pub dynamic_outputs: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>, kind: StageKind, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            factory: factory.into(),
            properties: BTreeMap::new(),
            ports: Vec::new(),
            dynamic_outputs: false,
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_dynamic_outputs(mut self) -> Self {
        self.dynamic_outputs = true;
        self
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    fn port_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.name == name)
    }

    /// Required configuration keys for this stage's kind that are not set.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        self.kind
            .required_keys()
            .iter()
            .copied()
            .filter(|key| !self.properties.contains_key(*key))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub from: PortRef,
    pub to: PortRef,
    /// Caps both ends agreed on
    pub caps: CapsDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HookKind {
    /// Count the frame in the stream's rate monitor
    RateAdvance,
    /// Rewrite labels and append the rate overlay
    Annotation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookAttachment {
    pub kind: HookKind,
    pub port: PortRef,
}

/// One hop of a dynamic branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BranchTarget {
    /// A stage entered through its `sink` port and left through its `src` port
    Stage(String),
    /// A specific input port, ending the branch
    Port(PortRef),
}

/// Branch completed at runtime once the source exposes a video port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicBranch {
    pub source: String,
    pub targets: Vec<BranchTarget>,
    pub resolved: bool,
}

impl DynamicBranch {
    /// Ports only the resolver links.
    fn pending_ports(&self) -> Vec<PortRef> {
        self.targets
            .iter()
            .flat_map(|target| match target {
                BranchTarget::Stage(name) => {
                    vec![PortRef::new(name, "sink"), PortRef::new(name, "src")]
                }
                BranchTarget::Port(port) => vec![port.clone()],
            })
            .collect()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PipelineGraph {
    stages: Vec<Stage>,
    links: Vec<Link>,
    hooks: Vec<HookAttachment>,
    dynamic_branch: Option<DynamicBranch>,
    #[serde(skip)]
    lifecycle: Lifecycle,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn hooks(&self) -> &[HookAttachment] {
        &self.hooks
    }

    pub fn hook(&self, kind: HookKind) -> Option<&HookAttachment> {
        self.hooks.iter().find(|h| h.kind == kind)
    }

    pub fn dynamic_branch(&self) -> Option<&DynamicBranch> {
        self.dynamic_branch.as_ref()
    }

    pub fn state(&self) -> PipelineState {
        self.lifecycle.state()
    }

    pub fn port(&self, port: &PortRef) -> Option<&Port> {
        self.stage(&port.stage).and_then(|s| s.port(&port.port))
    }

    /// Link attached to a port, if any.
    pub fn link_at(&self, port: &PortRef) -> Option<&Link> {
        self.links
            .iter()
            .find(|l| &l.from == port || &l.to == port)
    }

    pub fn is_linked(&self, port: &PortRef) -> bool {
        self.link_at(port).is_some()
    }

    /// Add a stage. Only allowed before the pipeline runs.
    pub fn add_stage(&mut self, stage: Stage) -> Result<(), ConstructionError> {
        if self.state() != PipelineState::Built {
            return Err(ConstructionError::new(
                &stage.name,
                format!("cannot add stages in state {}", self.state()),
            ));
        }
        if self.stage(&stage.name).is_some() {
            return Err(ConstructionError::new(&stage.name, "duplicate stage name"));
        }
        debug!(
            "Adding stage {} ({}, factory {})",
            stage.name, stage.kind, stage.factory
        );
        self.stages.push(stage);
        Ok(())
    }

    /// Link an output port to an input port.
    ///
    /// Fails when either port is missing or taken, when both ends are
    /// unresolved, when their caps do not intersect, or when the link would
    /// close a cycle. An unresolved end adopts the agreed caps.
    pub fn link(&mut self, from: &PortRef, to: &PortRef) -> Result<&Link, ConstructionError> {
        match self.state() {
            PipelineState::Built => {}
            PipelineState::Running if self.is_pending(from) && self.is_pending(to) => {}
            PipelineState::Running if self.is_dynamic_source(from) && self.is_pending(to) => {}
            state => {
                return Err(ConstructionError::new(
                    &to.stage,
                    format!("cannot link {} -> {} in state {}", from, to, state),
                ))
            }
        }

        let from_port = self
            .port(from)
            .ok_or_else(|| ConstructionError::new(&from.stage, format!("no port {}", from)))?;
        if from_port.direction != PortDirection::Output {
            return Err(ConstructionError::new(
                &from.stage,
                format!("{} is not an output port", from),
            ));
        }
        let to_port = self
            .port(to)
            .ok_or_else(|| ConstructionError::new(&to.stage, format!("no port {}", to)))?;
        if to_port.direction != PortDirection::Input {
            return Err(ConstructionError::new(
                &to.stage,
                format!("{} is not an input port", to),
            ));
        }

        for port in [from, to] {
            if self.is_linked(port) {
                return Err(ConstructionError::new(
                    &port.stage,
                    format!("port {} is already linked", port),
                ));
            }
        }

        let caps = match (&from_port.caps, &to_port.caps) {
            (None, None) => {
                return Err(ConstructionError::new(
                    &to.stage,
                    format!("unresolved port types at both ends of {} -> {}", from, to),
                ))
            }
            (Some(a), None) | (None, Some(a)) => a.clone(),
            (Some(a), Some(b)) => a.intersect(b).ok_or_else(|| {
                ConstructionError::new(
                    &to.stage,
                    format!("caps mismatch between {} ({}) and {} ({})", from, a, to, b),
                )
            })?,
        };

        if from.stage == to.stage || self.reaches(&to.stage, &from.stage) {
            return Err(ConstructionError::new(
                &to.stage,
                format!("linking {} -> {} would create a cycle", from, to),
            ));
        }

        for port in [from, to] {
            if let Some(p) = self
                .stages
                .iter_mut()
                .find(|s| s.name == port.stage)
                .and_then(|s| s.port_mut(&port.port))
            {
                if p.caps.is_none() {
                    debug!("Resolved {} to {}", port, caps);
                    p.caps = Some(caps.clone());
                }
            }
        }

        debug!("Linked {} -> {} ({})", from, to, caps);
        self.links.push(Link {
            from: from.clone(),
            to: to.clone(),
            caps,
        });
        Ok(&self.links[self.links.len() - 1])
    }

    /// Link `from:src` to `to:sink`.
    pub fn link_stages(&mut self, from: &str, to: &str) -> Result<&Link, ConstructionError> {
        self.link(&PortRef::new(from, "src"), &PortRef::new(to, "sink"))
    }

    /// Whether `to` is reachable from `from` by following links downstream.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(stage) = queue.pop_front() {
            if stage == to {
                return true;
            }
            if !seen.insert(stage) {
                continue;
            }
            for link in self.links.iter().filter(|l| l.from.stage == stage) {
                queue.push_back(link.to.stage.as_str());
            }
        }
        false
    }

    /// Ports still waiting for a link, ignoring the pending dynamic branch.
    pub fn unlinked_ports(&self) -> Vec<PortRef> {
        let pending: Vec<PortRef> = match &self.dynamic_branch {
            Some(branch) if !branch.resolved => branch.pending_ports(),
            _ => Vec::new(),
        };

        self.stages
            .iter()
            .flat_map(|stage| {
                stage
                    .ports
                    .iter()
                    .filter(|p| p.presence != PortPresence::Sometimes)
                    .map(move |p| PortRef::new(&stage.name, &p.name))
            })
            .filter(|port| !pending.contains(port) && !self.is_linked(port))
            .collect()
    }

    pub fn is_fully_linked(&self) -> bool {
        self.unlinked_ports().is_empty()
    }

    /// Register the attachment point of a per-buffer hook.
    pub fn add_hook(&mut self, kind: HookKind, port: PortRef) -> Result<(), ConstructionError> {
        if self.port(&port).is_none() {
            return Err(ConstructionError::new(
                &port.stage,
                format!("hook port {} does not exist", port),
            ));
        }
        if self.hook(kind).is_some() {
            return Err(ConstructionError::new(
                &port.stage,
                format!("{:?} hook registered twice", kind),
            ));
        }
        self.hooks.push(HookAttachment { kind, port });
        Ok(())
    }

    /// Declare the branch the resolver completes for `source`.
    pub fn set_dynamic_branch(
        &mut self,
        source: &str,
        targets: Vec<BranchTarget>,
    ) -> Result<(), ConstructionError> {
        if !self.stage(source).is_some_and(|s| s.dynamic_outputs) {
            return Err(ConstructionError::new(source, "stage has no dynamic outputs"));
        }
        for target in &targets {
            let known = match target {
                BranchTarget::Stage(name) => self.stage(name).is_some(),
                BranchTarget::Port(port) => self.port(port).is_some(),
            };
            if !known {
                return Err(ConstructionError::new(
                    source,
                    format!("unknown branch target {:?}", target),
                ));
            }
        }
        self.dynamic_branch = Some(DynamicBranch {
            source: source.to_string(),
            targets,
            resolved: false,
        });
        Ok(())
    }

    /// Record a port discovered at runtime on a dynamic source.
    ///
    /// Adding the same port twice returns the existing reference.
    pub fn add_dynamic_port(
        &mut self,
        port: &PortRef,
        caps: CapsDescriptor,
    ) -> Result<PortRef, ConstructionError> {
        if self.state().is_terminal() {
            return Err(ConstructionError::new(
                &port.stage,
                format!("pipeline is {}", self.state()),
            ));
        }
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.name == port.stage)
            .ok_or_else(|| ConstructionError::new(&port.stage, "no such stage"))?;
        if !stage.dynamic_outputs {
            return Err(ConstructionError::new(
                &port.stage,
                "stage does not expose dynamic outputs",
            ));
        }
        if stage.port(&port.port).is_none() {
            debug!("Discovered port {} ({})", port, caps);
            stage.ports.push(
                Port::output(&port.port, Some(caps)).with_presence(PortPresence::Sometimes),
            );
        }
        Ok(port.clone())
    }

    fn is_pending(&self, port: &PortRef) -> bool {
        self.dynamic_branch
            .as_ref()
            .is_some_and(|b| !b.resolved && b.pending_ports().contains(port))
    }

    fn is_dynamic_source(&self, port: &PortRef) -> bool {
        self.dynamic_branch
            .as_ref()
            .is_some_and(|b| b.source == port.stage)
            && self
                .port(port)
                .is_some_and(|p| p.presence == PortPresence::Sometimes)
    }

    /// Mark the dynamic branch complete once all of its ports are linked.
    pub(crate) fn settle_dynamic_branch(&mut self) -> bool {
        let Some(branch) = &self.dynamic_branch else {
            return false;
        };
        if branch.resolved {
            return true;
        }
        let complete = branch.pending_ports().iter().all(|p| self.is_linked(p));
        if complete {
            info!("Dynamic branch of {} fully linked", branch.source);
            if let Some(branch) = self.dynamic_branch.as_mut() {
                branch.resolved = true;
            }
        }
        complete
    }

    /// `Built -> Running`; requires every port outside the pending branch to be linked.
    pub fn start(&mut self) -> Result<PipelineState, LifecycleError> {
        let unlinked = self.unlinked_ports();
        if !unlinked.is_empty() {
            return Err(LifecycleError::NotFullyLinked(
                unlinked.iter().map(ToString::to_string).collect(),
            ));
        }
        self.lifecycle.start()
    }

    pub fn stop(&mut self) -> Result<PipelineState, LifecycleError> {
        self.lifecycle.stop()
    }

    pub fn fail(&mut self) -> PipelineState {
        self.lifecycle.fail()
    }

    pub fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    /// JSON dump of stages, links, hooks and the dynamic branch.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
