//! Fault-injecting destination wrapper for simulation.
//!
//! `FaultyTarget` wraps any keyed, append or bulk destination. Write
//! failures fire before the inner call; write timeouts fire after it, so
//! the destination may hold data the sink never saw acknowledged. A
//! permanent failure point makes every call touching a later position fail.

use super::append::{AppendLog, AppendRecord};
use super::olap::{BulkIngest, IngestOutcome, OlapRow};
use super::upsert::{KeyedTable, KeyedWrite};
use crate::buggify::faults::sink as faults;
use crate::event::Position;
use crate::io::simulation::SimulatedRng;
use crate::store::StoreFuture;
use parking_lot::Mutex;
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub struct TargetFaults {
    pub write_fail_prob: f64,
    pub write_timeout_prob: f64,
    pub flush_fail_prob: f64,
    /// Fail every write containing a position above this, forever.
    pub fail_after: Option<Position>,
}

impl TargetFaults {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn moderate() -> Self {
        TargetFaults {
            write_fail_prob: 0.02,
            write_timeout_prob: 0.01,
            flush_fail_prob: 0.02,
            fail_after: None,
        }
    }

    pub fn failing_after(position: Position) -> Self {
        TargetFaults {
            fail_after: Some(position),
            ..Self::default()
        }
    }
}

pub struct FaultyTarget<T> {
    inner: T,
    faults: TargetFaults,
    rng: Mutex<SimulatedRng>,
    injected: AtomicU64,
}

impl<T> FaultyTarget<T> {
    pub fn new(inner: T, rng: SimulatedRng, faults: TargetFaults) -> Self {
        FaultyTarget {
            inner,
            faults,
            rng: Mutex::new(rng),
            injected: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn roll(&self, fault: &str, prob: f64) -> bool {
        if prob <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock();
        crate::buggify!(&mut *rng, fault, prob)
    }

    fn fail(&self, what: &str) -> IoError {
        self.injected.fetch_add(1, Ordering::Relaxed);
        IoError::new(ErrorKind::ConnectionReset, format!("injected {}", what))
    }

    fn check_write(&self, max_position: Option<Position>) -> std::io::Result<()> {
        if let (Some(limit), Some(max)) = (self.faults.fail_after, max_position) {
            if max > limit {
                return Err(self.fail("permanent outage"));
            }
        }
        if self.roll(faults::WRITE_FAIL, self.faults.write_fail_prob) {
            return Err(self.fail("write failure"));
        }
        Ok(())
    }

    fn check_timeout(&self) -> std::io::Result<()> {
        if self.roll(faults::WRITE_TIMEOUT, self.faults.write_timeout_prob) {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(IoError::new(ErrorKind::TimedOut, "injected write timeout"));
        }
        Ok(())
    }

    fn check_flush(&self) -> std::io::Result<()> {
        if self.roll(faults::FLUSH_FAIL, self.faults.flush_fail_prob) {
            return Err(self.fail("flush failure"));
        }
        Ok(())
    }
}

impl<T: KeyedTable> KeyedTable for FaultyTarget<T> {
    fn write_batch<'a>(&'a self, writes: &'a [KeyedWrite]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            self.check_write(writes.iter().map(|w| w.position).max())?;
            let applied = self.inner.write_batch(writes).await?;
            self.check_timeout()?;
            Ok(applied)
        })
    }

    fn commit(&self, watermark: Position) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_write(Some(watermark))?;
            self.check_flush()?;
            self.inner.commit(watermark).await
        })
    }

    fn watermark(&self) -> StoreFuture<'_, Option<Position>> {
        self.inner.watermark()
    }

    fn prune_tombstones(&self, up_to: Position) -> StoreFuture<'_, usize> {
        self.inner.prune_tombstones(up_to)
    }
}

impl<T: AppendLog> AppendLog for FaultyTarget<T> {
    fn append<'a>(&'a self, records: &'a [AppendRecord]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            self.check_write(records.last().map(|r| r.position))?;
            let taken = self.inner.append(records).await?;
            self.check_timeout()?;
            Ok(taken)
        })
    }

    fn commit(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move {
            self.check_flush()?;
            let tail = self.inner.commit().await?;
            self.check_timeout()?;
            Ok(tail)
        })
    }

    fn last_durable(&self) -> StoreFuture<'_, Option<Position>> {
        self.inner.last_durable()
    }
}

impl<T: BulkIngest> BulkIngest for FaultyTarget<T> {
    fn ingest<'a>(&'a self, label: &'a str, rows: &'a [OlapRow]) -> StoreFuture<'a, IngestOutcome> {
        Box::pin(async move {
            self.check_write(rows.last().map(|r| r.position))?;
            let outcome = self.inner.ingest(label, rows).await?;
            self.check_timeout()?;
            Ok(outcome)
        })
    }

    fn loaded_through(&self) -> StoreFuture<'_, Option<Position>> {
        self.inner.loaded_through()
    }
}
