//! Pipeline lifecycle state definitions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an assembled pipeline.
///
/// `Built -> Running -> Stopped`; `Failed` is terminal and reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PipelineState {
    /// Graph constructed, nothing flowing yet
    #[default]
    Built,
    /// Buffers are flowing
    Running,
    /// Stopped on request, end-of-stream or a runtime error
    Stopped,
    /// Unrecoverable construction or linking error
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Built => write!(f, "BUILT"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}
