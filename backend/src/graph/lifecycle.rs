//! Pipeline lifecycle state machine.

use osdcast_types::{PipelineState, RuntimeNotification};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cannot {action} a pipeline in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: PipelineState,
    },

    #[error("Pipeline is not fully linked, unlinked ports: {}", .0.join(", "))]
    NotFullyLinked(Vec<String>),
}

/// `Built -> Running -> Stopped`, with `Failed` reachable from anywhere.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    state: PipelineState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// `Built -> Running`. Callers check the graph is fully linked first.
    pub fn start(&mut self) -> Result<PipelineState, LifecycleError> {
        match self.state {
            PipelineState::Built => self.transition(PipelineState::Running),
            state => Err(LifecycleError::InvalidTransition {
                action: "start",
                state,
            }),
        }
    }

    /// `Running -> Stopped`. Stopping twice, or stopping a failed pipeline,
    /// leaves the state unchanged.
    pub fn stop(&mut self) -> Result<PipelineState, LifecycleError> {
        match self.state {
            PipelineState::Running => self.transition(PipelineState::Stopped),
            PipelineState::Stopped | PipelineState::Failed => {
                debug!("Stop requested in state {}, nothing to do", self.state);
                Ok(self.state)
            }
            state => Err(LifecycleError::InvalidTransition {
                action: "stop",
                state,
            }),
        }
    }

    /// Enter the terminal `Failed` state.
    pub fn fail(&mut self) -> PipelineState {
        if self.state != PipelineState::Failed {
            warn!("Pipeline failed in state {}", self.state);
            self.state = PipelineState::Failed;
        }
        self.state
    }

    /// Apply a bus notification. End-of-stream and errors stop a running pipeline.
    pub fn on_notification(&mut self, notification: &RuntimeNotification) -> Option<PipelineState> {
        if !notification.requests_stop() || self.state != PipelineState::Running {
            return None;
        }
        info!("Stopping pipeline: {}", notification.description());
        self.stop().ok()
    }

    fn transition(&mut self, next: PipelineState) -> Result<PipelineState, LifecycleError> {
        info!("Pipeline state: {} -> {}", self.state, next);
        self.state = next;
        Ok(next)
    }
}
