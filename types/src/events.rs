//! Runtime notifications surfaced by the pipeline bus.

use crate::state::PipelineState;
use serde::{Deserialize, Serialize};

/// Lifecycle and error messages posted while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RuntimeNotification {
    /// The source ran dry and all buffers reached the sink
    EndOfStream,
    /// An element reported an error
    Error {
        source: Option<String>,
        message: String,
        debug: Option<String>,
    },
    Warning {
        source: Option<String>,
        message: String,
        debug: Option<String>,
    },
    Info {
        source: Option<String>,
        message: String,
    },
    /// The lifecycle state of the pipeline changed
    StateChanged {
        old: PipelineState,
        new: PipelineState,
    },
}

impl RuntimeNotification {
    /// Whether this notification asks the pipeline to stop.
    pub fn requests_stop(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Error { .. })
    }

    /// Get a human-readable description of the notification.
    pub fn description(&self) -> String {
        match self {
            Self::EndOfStream => "End of stream".to_string(),
            Self::Error {
                source, message, ..
            } => match source {
                Some(src) => format!("Error from {}: {}", src, message),
                None => format!("Error: {}", message),
            },
            Self::Warning {
                source, message, ..
            } => match source {
                Some(src) => format!("Warning from {}: {}", src, message),
                None => format!("Warning: {}", message),
            },
            Self::Info { source, message } => match source {
                Some(src) => format!("Info from {}: {}", src, message),
                None => format!("Info: {}", message),
            },
            Self::StateChanged { old, new } => format!("State changed: {} -> {}", old, new),
        }
    }
}
