//! In-process change log.
//!
//! Backs unit tests and simulation. Supports retention truncation, forced
//! disconnects and injected stream failures so reader recovery paths can be
//! exercised without a database.

use super::{check_resume, ChangeStream, SourceError, SourceFuture, SourceLog};
use crate::buggify::faults::source as faults;
use crate::event::{Position, RawChangeRecord, StartPosition};
use crate::io::SimulatedRng;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct LogState {
    records: VecDeque<RawChangeRecord>,
    head: Option<Position>,
    /// Highest position removed by retention.
    truncated_through: Option<Position>,
    /// Bumped by `disconnect`; open streams from older generations fail.
    generation: u64,
}

struct FaultState {
    rng: SimulatedRng,
    disconnect_prob: f64,
}

#[derive(Default)]
struct LogInner {
    state: RwLock<LogState>,
    faults: Mutex<Option<FaultState>>,
    appended: Notify,
}

/// Shared in-memory log. Clones refer to the same log.
#[derive(Clone, Default)]
pub struct InMemoryChangeLog {
    inner: Arc<LogInner>,
}

impl InMemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail open streams and head queries with probability `disconnect_prob`
    /// per call.
    pub fn with_faults(self, rng: SimulatedRng, disconnect_prob: f64) -> Self {
        *self.inner.faults.lock() = Some(FaultState {
            rng,
            disconnect_prob,
        });
        self
    }

    /// Stop injecting stream failures.
    pub fn heal(&self) {
        *self.inner.faults.lock() = None;
    }

    /// Append at the next position and return it.
    pub fn append(&self, payload: impl Into<Bytes>, commit_timestamp: u64) -> Position {
        let position = {
            let mut state = self.inner.state.write();
            let position = state.head.unwrap_or(Position::ZERO).next();
            state
                .records
                .push_back(RawChangeRecord::new(position, commit_timestamp, payload));
            state.head = Some(position);
            position
        };
        self.inner.appended.notify_waiters();
        position
    }

    /// Append a record with an explicit position, which must exceed the head.
    pub fn push(&self, record: RawChangeRecord) -> Result<(), SourceError> {
        {
            let mut state = self.inner.state.write();
            if let Some(head) = state.head {
                if record.position <= head {
                    return Err(SourceError::OutOfOrder {
                        previous: head,
                        received: record.position,
                    });
                }
            }
            state.head = Some(record.position);
            state.records.push_back(record);
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }

    /// Drop every record below `position`.
    pub fn truncate_before(&self, position: Position) -> usize {
        let mut state = self.inner.state.write();
        let mut removed = 0;
        while let Some(front) = state.records.front() {
            if front.position >= position {
                break;
            }
            let pos = front.position;
            state.records.pop_front();
            state.truncated_through = Some(pos);
            removed += 1;
        }
        removed
    }

    /// Break every open stream.
    pub fn disconnect(&self) {
        self.inner.state.write().generation += 1;
        self.inner.appended.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self) -> Option<Position> {
        self.inner.state.read().head
    }

    fn earliest(state: &LogState) -> Option<Position> {
        match state.truncated_through {
            Some(t) => Some(t.next()),
            None => state.records.front().map(|r| r.position),
        }
    }

    fn inject(&self, fault: &str) -> bool {
        let mut guard = self.inner.faults.lock();
        match guard.as_mut() {
            Some(f) => crate::buggify!(&mut f.rng, fault, f.disconnect_prob),
            None => false,
        }
    }

    fn check_query(&self) -> Result<(), SourceError> {
        if self.inject(faults::QUERY_FAIL) {
            return Err(SourceError::Disconnected("injected query failure".into()));
        }
        Ok(())
    }
}

struct MemoryStream {
    log: InMemoryChangeLog,
    after: Option<Position>,
    generation: u64,
}

impl MemoryStream {
    fn ready(&mut self) -> Result<Option<RawChangeRecord>, SourceError> {
        let state = self.log.inner.state.read();
        if state.generation != self.generation {
            return Err(SourceError::Disconnected("stream reset by source".into()));
        }
        let after = self.after.unwrap_or(Position::ZERO);
        if let Some(truncated) = state.truncated_through {
            if truncated > after {
                return Err(SourceError::PositionLost {
                    requested: after,
                    earliest: truncated.next(),
                });
            }
        }
        let idx = state.records.partition_point(|r| r.position <= after);
        match state.records.get(idx) {
            Some(record) => {
                self.after = Some(record.position);
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }
}

impl ChangeStream for MemoryStream {
    fn next_record(&mut self) -> SourceFuture<'_, RawChangeRecord> {
        Box::pin(async move {
            if self.log.inject(faults::DISCONNECT) {
                return Err(SourceError::Disconnected("injected disconnect".into()));
            }
            let log = self.log.clone();
            loop {
                let notified = log.inner.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(record) = self.ready()? {
                    return Ok(record);
                }
                notified.await;
            }
        })
    }
}

impl SourceLog for InMemoryChangeLog {
    fn open_stream(&self, start: StartPosition) -> SourceFuture<'_, Box<dyn ChangeStream>> {
        Box::pin(async move {
            let state = self.inner.state.read();
            let after = match start {
                StartPosition::Earliest => state.truncated_through,
                StartPosition::Head => state.head,
                StartPosition::At(p) => {
                    check_resume(p, Self::earliest(&state), state.head)?;
                    Some(p)
                }
            };
            let stream: Box<dyn ChangeStream> = Box::new(MemoryStream {
                log: self.clone(),
                after,
                generation: state.generation,
            });
            Ok(stream)
        })
    }

    fn current_head_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move {
            self.check_query()?;
            Ok(self.inner.state.read().head)
        })
    }

    fn earliest_retained_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move {
            self.check_query()?;
            Ok(Self::earliest(&self.inner.state.read()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_n(stream: &mut Box<dyn ChangeStream>, n: usize) -> Vec<u64> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(stream.next_record().await.unwrap().position.0);
        }
        out
    }

    #[tokio::test]
    async fn test_positions_are_assigned_in_order() {
        let log = InMemoryChangeLog::new();
        assert_eq!(log.append("a", 1), Position(1));
        assert_eq!(log.append("b", 2), Position(2));
        assert_eq!(log.current_head_position().await.unwrap(), Some(Position(2)));
    }

    #[tokio::test]
    async fn test_open_after_position() {
        let log = InMemoryChangeLog::new();
        for i in 0..5 {
            log.append(format!("r{}", i), 0);
        }
        let mut stream = log.open_stream(StartPosition::At(Position(3))).await.unwrap();
        assert_eq!(read_n(&mut stream, 2).await, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_head_start_skips_existing() {
        let log = InMemoryChangeLog::new();
        log.append("old", 0);
        let mut stream = log.open_stream(StartPosition::Head).await.unwrap();
        log.append("new", 0);
        assert_eq!(read_n(&mut stream, 1).await, vec![2]);
    }

    #[tokio::test]
    async fn test_stream_waits_for_append() {
        let log = InMemoryChangeLog::new();
        let mut stream = log.open_stream(StartPosition::Earliest).await.unwrap();
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("late", 0);
        });
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next_record())
            .await
            .expect("append should wake the stream")
            .unwrap();
        assert_eq!(record.payload, Bytes::from("late"));
    }

    #[tokio::test]
    async fn test_truncated_resume_is_position_lost() {
        let log = InMemoryChangeLog::new();
        for _ in 0..10 {
            log.append("x", 0);
        }
        log.truncate_before(Position(6));
        assert_eq!(
            log.earliest_retained_position().await.unwrap(),
            Some(Position(6))
        );
        assert!(log.open_stream(StartPosition::At(Position(5))).await.is_ok());
        let err = log
            .open_stream(StartPosition::At(Position(3)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::PositionLost { .. }));
    }

    #[tokio::test]
    async fn test_earliest_after_truncation_starts_at_retained() {
        let log = InMemoryChangeLog::new();
        for _ in 0..4 {
            log.append("x", 0);
        }
        log.truncate_before(Position(3));
        let mut stream = log.open_stream(StartPosition::Earliest).await.unwrap();
        assert_eq!(read_n(&mut stream, 2).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_disconnect_breaks_open_streams() {
        let log = InMemoryChangeLog::new();
        log.append("x", 0);
        let mut stream = log.open_stream(StartPosition::Earliest).await.unwrap();
        log.disconnect();
        let err = stream.next_record().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_push_rejects_non_increasing() {
        let log = InMemoryChangeLog::new();
        log.push(RawChangeRecord::new(Position(10), 0, "a")).unwrap();
        let err = log.push(RawChangeRecord::new(Position(10), 0, "b")).unwrap_err();
        assert!(matches!(err, SourceError::OutOfOrder { .. }));
    }
}
