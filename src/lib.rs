pub mod io;
pub mod buggify;
pub mod clock;
pub mod event;
pub mod store;
pub mod retry;
pub mod source;
pub mod decode;
pub mod position;
pub mod router;
pub mod sink;
pub mod checkpoint;
pub mod transport;
pub mod pipeline;
pub mod observability;
pub mod dst;

#[cfg(test)]
mod stateright;

pub use event::{ChangeEvent, Operation, Position, RawChangeRecord, StartPosition, TableId};
pub use pipeline::{
    PipelineBuilder, PipelineConfig, PipelineError, PipelineHandle, PipelinePhase, PipelineStatus,
};
pub use router::{Router, SinkId};
pub use sink::{SinkError, SinkKind, SinkWriter};
pub use source::{LogReader, SourceError, SourceLog};
