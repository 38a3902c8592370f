//! LogReader: ordered, resumable consumption of a source log.
//!
//! Wraps a [`SourceLog`] stream with reconnect-on-failure, retention checks
//! on resume and a strict ordering guard. After a reconnect the stream is
//! re-opened at the last position handed out. Records a freshly opened
//! stream replays at or below that point are dropped, so the caller never
//! sees a duplicate or a gap.

use super::{ChangeStream, SharedSource, SourceError};
use crate::event::{Position, RawChangeRecord, StartPosition};
use crate::io::ProductionRng;
use crate::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub records_read: u64,
    pub reconnects: u64,
    /// Records a re-opened stream replayed at or below the resume point.
    pub replays_skipped: u64,
}

pub struct LogReader {
    source: SharedSource,
    retry: RetryPolicy,
    cancel: CancellationToken,
    stream: Option<Box<dyn ChangeStream>>,
    start: StartPosition,
    last_position: Option<Position>,
    /// Set on every open; records up to here are replays, not regressions.
    replay_floor: Option<Position>,
    rng: ProductionRng,
    stats: ReaderStats,
}

impl LogReader {
    pub fn new(source: SharedSource, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        LogReader {
            source,
            retry,
            cancel,
            stream: None,
            start: StartPosition::Earliest,
            last_position: None,
            replay_floor: None,
            rng: ProductionRng::new(),
            stats: ReaderStats::default(),
        }
    }

    /// Open at `from`. Fails with [`SourceError::PositionLost`] if the
    /// source no longer retains the resume point.
    pub async fn open(&mut self, from: StartPosition) -> Result<(), SourceError> {
        self.start = from;
        self.last_position = match from {
            StartPosition::At(p) => Some(p),
            _ => None,
        };
        self.replay_floor = self.last_position;
        let mut attempt = 0;
        loop {
            match self.source.open_stream(from).await {
                Ok(stream) => {
                    info!(start = %from, "Opened change stream");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    self.backoff(attempt, &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Next record, strictly after the previous one.
    pub async fn next(&mut self) -> Result<RawChangeRecord, SourceError> {
        let mut attempt = 0;
        loop {
            if self.stream.is_none() {
                match self.reopen().await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        attempt += 1;
                        self.backoff(attempt, &e).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SourceError::Cancelled),
                r = stream.next_record() => r,
            };
            match result {
                Ok(record) => {
                    if let Some(floor) = self.replay_floor {
                        if record.position <= floor {
                            debug!(position = %record.position, floor = %floor, "Dropping replayed record");
                            self.stats.replays_skipped += 1;
                            continue;
                        }
                        self.replay_floor = None;
                    }
                    if let Some(previous) = self.last_position {
                        if record.position <= previous {
                            return Err(SourceError::OutOfOrder {
                                previous,
                                received: record.position,
                            });
                        }
                    }
                    self.last_position = Some(record.position);
                    self.stats.records_read += 1;
                    return Ok(record);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, last_position = ?self.last_position, "Change stream failed, reconnecting");
                    self.stream = None;
                    attempt += 1;
                    self.backoff(attempt, &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Position of the last record returned (or the resume point).
    pub fn last_position(&self) -> Option<Position> {
        self.last_position
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(last_position = ?self.last_position, "Closed change stream");
        }
    }

    async fn reopen(&mut self) -> Result<(), SourceError> {
        let from = match self.last_position {
            Some(p) => StartPosition::At(p),
            None => self.start,
        };
        self.stats.reconnects += 1;
        // A fresh open re-validates retention for the resume point.
        let stream = self.source.open_stream(from).await?;
        info!(start = %from, reconnects = self.stats.reconnects, "Re-opened change stream");
        self.stream = Some(stream);
        self.replay_floor = self.last_position;
        Ok(())
    }

    async fn backoff(&mut self, attempt: u32, error: &SourceError) -> Result<(), SourceError> {
        if !self.retry.allows(attempt) {
            return Err(SourceError::RetriesExhausted {
                attempts: attempt,
                last_error: error.to_string(),
            });
        }
        let delay = self.retry.delay(attempt, &mut self.rng);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{InMemoryChangeLog, SourceFuture, SourceLog};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn reader_for(log: &InMemoryChangeLog) -> LogReader {
        LogReader::new(
            Arc::new(log.clone()),
            RetryPolicy::test(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_reads_in_order_from_earliest() {
        let log = InMemoryChangeLog::new();
        for i in 0..5 {
            log.append(format!("r{}", i), 0);
        }
        let mut reader = reader_for(&log);
        reader.open(StartPosition::Earliest).await.unwrap();
        for expected in 1..=5 {
            assert_eq!(reader.next().await.unwrap().position, Position(expected));
        }
        assert_eq!(reader.last_position(), Some(Position(5)));
    }

    #[tokio::test]
    async fn test_reconnect_resumes_without_duplicates() {
        let log = InMemoryChangeLog::new();
        for _ in 0..6 {
            log.append("x", 0);
        }
        let mut reader = reader_for(&log);
        reader.open(StartPosition::Earliest).await.unwrap();
        assert_eq!(reader.next().await.unwrap().position, Position(1));
        assert_eq!(reader.next().await.unwrap().position, Position(2));

        log.disconnect();

        let rest: Vec<u64> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(reader.next().await.unwrap().position.0);
            }
            v
        };
        assert_eq!(rest, vec![3, 4, 5, 6]);
        assert_eq!(reader.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_position_lost_on_open() {
        let log = InMemoryChangeLog::new();
        for _ in 0..10 {
            log.append("x", 0);
        }
        log.truncate_before(Position(8));
        let mut reader = reader_for(&log);
        let err = reader.open(StartPosition::At(Position(3))).await.unwrap_err();
        assert!(matches!(err, SourceError::PositionLost { .. }));
    }

    #[tokio::test]
    async fn test_position_lost_while_disconnected() {
        let log = InMemoryChangeLog::new();
        for _ in 0..4 {
            log.append("x", 0);
        }
        let mut reader = reader_for(&log);
        reader.open(StartPosition::Earliest).await.unwrap();
        reader.next().await.unwrap();

        log.disconnect();
        log.truncate_before(Position(4));

        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, SourceError::PositionLost { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_read() {
        let log = InMemoryChangeLog::new();
        let cancel = CancellationToken::new();
        let mut reader = LogReader::new(Arc::new(log), RetryPolicy::test(), cancel.clone());
        reader.open(StartPosition::Earliest).await.unwrap();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, SourceError::Cancelled));
    }

    /// Source whose stream hands back the same record twice.
    struct Stuttering {
        record: Mutex<Option<RawChangeRecord>>,
    }

    struct StutterStream(RawChangeRecord);

    impl ChangeStream for StutterStream {
        fn next_record(&mut self) -> SourceFuture<'_, RawChangeRecord> {
            let record = self.0.clone();
            Box::pin(async move { Ok(record) })
        }
    }

    impl SourceLog for Stuttering {
        fn open_stream(&self, _start: StartPosition) -> SourceFuture<'_, Box<dyn ChangeStream>> {
            let record = self.record.lock().clone();
            Box::pin(async move {
                let stream: Box<dyn ChangeStream> = Box::new(StutterStream(
                    record.ok_or_else(|| SourceError::Disconnected("empty".into()))?,
                ));
                Ok(stream)
            })
        }

        fn current_head_position(&self) -> SourceFuture<'_, Option<Position>> {
            Box::pin(async { Ok(Some(Position(1))) })
        }

        fn earliest_retained_position(&self) -> SourceFuture<'_, Option<Position>> {
            Box::pin(async { Ok(Some(Position(1))) })
        }
    }

    #[tokio::test]
    async fn test_out_of_order_is_fatal() {
        let source = Stuttering {
            record: Mutex::new(Some(RawChangeRecord::new(Position(1), 0, "dup"))),
        };
        let mut reader = LogReader::new(Arc::new(source), RetryPolicy::test(), CancellationToken::new());
        reader.open(StartPosition::Earliest).await.unwrap();
        reader.next().await.unwrap();
        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, SourceError::OutOfOrder { .. }));
    }

    /// Re-sends the resume position itself on every `At` open.
    struct InclusiveResume(InMemoryChangeLog);

    impl SourceLog for InclusiveResume {
        fn open_stream(&self, start: StartPosition) -> SourceFuture<'_, Box<dyn ChangeStream>> {
            let start = match start {
                StartPosition::At(p) if p.0 > 1 => StartPosition::At(Position(p.0 - 1)),
                StartPosition::At(_) => StartPosition::Earliest,
                other => other,
            };
            self.0.open_stream(start)
        }

        fn current_head_position(&self) -> SourceFuture<'_, Option<Position>> {
            self.0.current_head_position()
        }

        fn earliest_retained_position(&self) -> SourceFuture<'_, Option<Position>> {
            self.0.earliest_retained_position()
        }
    }

    #[tokio::test]
    async fn test_replayed_resume_record_dropped_after_reconnect() {
        let log = InMemoryChangeLog::new();
        for _ in 0..5 {
            log.append("x", 0);
        }
        let mut reader = LogReader::new(
            Arc::new(InclusiveResume(log.clone())),
            RetryPolicy::test(),
            CancellationToken::new(),
        );
        reader.open(StartPosition::At(Position(1))).await.unwrap();
        assert_eq!(reader.next().await.unwrap().position, Position(2));
        assert_eq!(reader.next().await.unwrap().position, Position(3));

        log.disconnect();

        for expected in 4..=5 {
            assert_eq!(reader.next().await.unwrap().position, Position(expected));
        }
        assert_eq!(reader.stats().reconnects, 1);
        assert_eq!(reader.stats().replays_skipped, 2);
        assert_eq!(reader.stats().records_read, 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted_when_source_stays_down() {
        let source = Stuttering {
            record: Mutex::new(None),
        };
        let mut reader = LogReader::new(Arc::new(source), RetryPolicy::test(), CancellationToken::new());
        let err = reader.open(StartPosition::Earliest).await.unwrap_err();
        assert!(matches!(err, SourceError::RetriesExhausted { .. }));
    }
}
