//! Source change logs.
//!
//! A [`SourceLog`] is an ordered, append-only log of committed row changes
//! that can be opened at a position. [`LogReader`] sits on top and adds
//! reconnects, retention checks and ordering enforcement.

pub mod file;
pub mod memory;
pub mod reader;

pub use file::{FileChangeLog, FileLogConfig};
pub use memory::InMemoryChangeLog;
pub use reader::{LogReader, ReaderStats};

use crate::event::{Position, RawChangeRecord, StartPosition};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

#[derive(Debug)]
pub enum SourceError {
    /// Connection or stream dropped. Retryable.
    Disconnected(String),
    Io(std::io::Error),
    /// The requested resume point has been removed by retention.
    PositionLost {
        requested: Position,
        earliest: Position,
    },
    /// The requested resume point is beyond anything the source has issued.
    PositionAhead { requested: Position, head: Option<Position> },
    /// Source returned a position not greater than the previous one.
    OutOfOrder {
        previous: Position,
        received: Position,
    },
    /// Stored log data failed validation.
    Corrupt(String),
    /// Transient failures persisted past the retry budget.
    RetriesExhausted { attempts: u32, last_error: String },
    Cancelled,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Disconnected(_) => true,
            SourceError::Io(e) => crate::store::is_transient(e),
            _ => false,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Disconnected(msg) => write!(f, "source disconnected: {}", msg),
            SourceError::Io(e) => write!(f, "source I/O error: {}", e),
            SourceError::PositionLost {
                requested,
                earliest,
            } => write!(
                f,
                "position {} no longer retained (earliest retained {}); re-snapshot required",
                requested, earliest
            ),
            SourceError::PositionAhead { requested, head } => match head {
                Some(h) => write!(f, "position {} is ahead of source head {}", requested, h),
                None => write!(f, "position {} requested from an empty source", requested),
            },
            SourceError::OutOfOrder { previous, received } => write!(
                f,
                "source returned position {} after {}",
                received, previous
            ),
            SourceError::Corrupt(msg) => write!(f, "corrupt change log: {}", msg),
            SourceError::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "source unavailable after {} attempts: {}",
                attempts, last_error
            ),
            SourceError::Cancelled => write!(f, "read cancelled"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io(e)
    }
}

/// An open, ordered stream of records.
///
/// `next_record` waits while nothing new is available. It must be safe to
/// drop the returned future at any await point: the reader races it
/// against cancellation.
pub trait ChangeStream: Send {
    fn next_record(&mut self) -> SourceFuture<'_, RawChangeRecord>;
}

pub trait SourceLog: Send + Sync + 'static {
    /// Open a stream. `At(p)` yields records with position > p. A source
    /// that also replays `p` itself is tolerated; [`LogReader`] drops it.
    fn open_stream(&self, start: StartPosition) -> SourceFuture<'_, Box<dyn ChangeStream>>;

    /// Highest position ever issued, `None` if the log has never had data.
    fn current_head_position(&self) -> SourceFuture<'_, Option<Position>>;

    /// Oldest position still readable, `None` if nothing is retained.
    fn earliest_retained_position(&self) -> SourceFuture<'_, Option<Position>>;
}

pub type SharedSource = Arc<dyn SourceLog>;

/// Retention check shared by sources: resuming after `after` needs
/// `after + 1` to still be readable.
pub(crate) fn check_resume(
    after: Position,
    earliest: Option<Position>,
    head: Option<Position>,
) -> Result<(), SourceError> {
    if after > head.unwrap_or(Position::ZERO) {
        return Err(SourceError::PositionAhead {
            requested: after,
            head,
        });
    }
    // Fully truncated log: only the head itself is a valid resume point.
    let earliest = earliest.or_else(|| head.map(|h| h.next()));
    if let Some(earliest) = earliest {
        if after.next() < earliest {
            return Err(SourceError::PositionLost {
                requested: after,
                earliest,
            });
        }
    }
    Ok(())
}
