//! Buffered transport: a durable, partitioned topic between the source log
//! and one or more pipelines.
//!
//! ```text
//! source log ─► TopicPublisher ─► Topic (object store) ─┬─► TopicSource ─► pipeline "search"
//!                                                       └─► TopicSource ─► pipeline "warehouse"
//! ```
//!
//! [`TopicSource`] implements [`crate::source::SourceLog`], so a pipeline
//! reading through the topic runs exactly the same reader, router, sinks
//! and checkpointer as one reading the source directly. Each consumer
//! group is an ordinary pipeline with its own id and stored position.

pub mod manifest;
pub mod publisher;
pub mod segment;
pub mod source;
pub mod topic;

pub use manifest::{PartitionManifest, SegmentInfo};
pub use publisher::{PublisherStats, TopicPublisher};
pub use segment::{Compression, SegmentError};
pub use source::TopicSource;
pub use topic::{PublishOutcome, Topic, TopicConfig};

use crate::decode::DecodeError;
use crate::event::Position;
use crate::position::PositionStoreError;
use crate::source::SourceError;
use std::fmt;

#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Segment { key: String, source: SegmentError },
    /// Retention removed records after the requested position.
    PositionLost {
        partition: u32,
        requested: Position,
        earliest: Option<Position>,
    },
    InvalidPartition { partition: u32, partitions: u32 },
    Config(String),
    Source(SourceError),
    Decode(DecodeError),
    Position(PositionStoreError),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(e) => crate::store::is_transient(e),
            TransportError::Source(e) => e.is_transient(),
            TransportError::Position(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "topic I/O error: {}", e),
            TransportError::Segment { key, source } => write!(f, "segment {}: {}", key, source),
            TransportError::PositionLost {
                partition,
                requested,
                earliest,
            } => write!(
                f,
                "partition {} no longer retains records after {} (earliest {:?})",
                partition, requested, earliest
            ),
            TransportError::InvalidPartition {
                partition,
                partitions,
            } => write!(
                f,
                "partition {} out of range for a topic with {} partitions",
                partition, partitions
            ),
            TransportError::Config(msg) => write!(f, "invalid topic configuration: {}", msg),
            TransportError::Source(e) => write!(f, "{}", e),
            TransportError::Decode(e) => write!(f, "{}", e),
            TransportError::Position(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Segment { source, .. } => Some(source),
            TransportError::Source(e) => Some(e),
            TransportError::Position(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<SourceError> for TransportError {
    fn from(e: SourceError) -> Self {
        TransportError::Source(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        TransportError::Decode(e)
    }
}

impl From<PositionStoreError> for TransportError {
    fn from(e: PositionStoreError) -> Self {
        TransportError::Position(e)
    }
}

/// How topic failures surface to a pipeline reading through [`TopicSource`].
impl From<TransportError> for SourceError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => SourceError::Io(e),
            TransportError::PositionLost {
                requested,
                earliest,
                ..
            } => SourceError::PositionLost {
                requested,
                earliest: earliest.unwrap_or(requested.next()),
            },
            TransportError::Source(e) => e,
            other => SourceError::Corrupt(other.to_string()),
        }
    }
}
