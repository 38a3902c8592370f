//! PipelineCoordinator: owns one pipeline's lifecycle.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌────────────── control loop ──────────────┐
//!                       │ checkpointer · lease renewal · status    │
//!                       └───────▲──────────────┬───────────────────┘
//!                               │ progress     │ barriers / persist
//! LogReader ─► EventDecoder ─► Router ─► SinkWorker queues ─► destinations
//!                                               │
//!                                               └─► PositionStore
//! ```
//!
//! The read loop and each sink worker run as separate tasks. The control
//! loop never touches events; it sees only dispatch progress, barrier
//! answers and operator commands.

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod status;

pub use builder::PipelineBuilder;
pub use config::{
    BindingConfig, ConfigError, LeaseConfig, PipelineConfig, QueueConfig, SinkConfig,
    TransportConfig,
};
pub use coordinator::{PipelineHandle, StopReport};
pub use status::{PipelinePhase, PipelineStatus, SinkLag};

use crate::decode::DecodeError;
use crate::position::PositionStoreError;
use crate::router::SinkId;
use crate::source::SourceError;
use crate::transport::TransportError;
use std::fmt;

#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    /// Lease or checkpoint record failure, including a lease held elsewhere.
    Position(PositionStoreError),
    /// Configured table-to-sink bindings differ from the stored ones.
    BindingsChanged {
        pipeline_id: String,
        stored: String,
        configured: String,
    },
    Source(SourceError),
    Decode(DecodeError),
    /// The buffered topic could not be opened.
    Transport(TransportError),
    /// A configured sink has no writer.
    MissingSink(SinkId),
    /// A pipeline task ended unexpectedly.
    TaskFailed(String),
    /// The pipeline is no longer running.
    NotRunning { phase: PipelinePhase, reason: Option<String> },
}

impl PipelineError {
    /// Short operator-facing reason recorded in the status.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::Position(e) => write!(f, "{}", e),
            PipelineError::BindingsChanged {
                pipeline_id,
                stored,
                configured,
            } => write!(
                f,
                "sink bindings for pipeline {} changed (stored {}, configured {}); start a new pipeline id",
                pipeline_id, stored, configured
            ),
            PipelineError::Source(e) => write!(f, "{}", e),
            PipelineError::Decode(e) => write!(f, "{}", e),
            PipelineError::Transport(e) => write!(f, "{}", e),
            PipelineError::MissingSink(id) => write!(f, "no writer for configured sink {}", id),
            PipelineError::TaskFailed(msg) => write!(f, "pipeline task failed: {}", msg),
            PipelineError::NotRunning { phase, reason } => match reason {
                Some(reason) => write!(f, "pipeline is {}: {}", phase, reason),
                None => write!(f, "pipeline is {}", phase),
            },
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(e) => Some(e),
            PipelineError::Position(e) => Some(e),
            PipelineError::Source(e) => Some(e),
            PipelineError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}

impl From<PositionStoreError> for PipelineError {
    fn from(e: PositionStoreError) -> Self {
        PipelineError::Position(e)
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        PipelineError::Source(e)
    }
}

impl From<DecodeError> for PipelineError {
    fn from(e: DecodeError) -> Self {
        PipelineError::Decode(e)
    }
}

impl From<TransportError> for PipelineError {
    fn from(e: TransportError) -> Self {
        PipelineError::Transport(e)
    }
}
