//! PositionStore: durable checkpoint records guarded by a lease.
//!
//! Each pipeline owns two objects under `{prefix}/{pipeline_id}/`:
//!
//! - `lease.json`: current holder, fencing epoch and expiry
//! - `state.json`: the committed [`PipelineState`]
//!
//! Both are updated with conditional puts. A commit first proves the
//! caller's lease is still the one on record, then swaps the state object
//! against the entity tag it read, so two instances can never interleave
//! commits for the same pipeline.

use crate::clock::{SharedClock, Timestamp};
use crate::event::Position;
use crate::router::SinkId;
use crate::store::{PutCondition, SharedStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Error as IoError;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum PositionStoreError {
    Io(IoError),
    Json(serde_json::Error),
    /// Another live instance holds the lease.
    LeaseConflict {
        pipeline_id: String,
        holder: String,
        expires_at_ms: u64,
    },
    /// Our lease was taken over or expired.
    LeaseLost { pipeline_id: String, reason: String },
    /// Commit would move a position backwards.
    Regression {
        sink: Option<SinkId>,
        stored: Position,
        attempted: Option<Position>,
    },
}

impl PositionStoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            PositionStoreError::Io(e) => crate::store::is_transient(e),
            _ => false,
        }
    }
}

impl fmt::Display for PositionStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStoreError::Io(e) => write!(f, "position store I/O error: {}", e),
            PositionStoreError::Json(e) => write!(f, "position store record invalid: {}", e),
            PositionStoreError::LeaseConflict {
                pipeline_id,
                holder,
                expires_at_ms,
            } => write!(
                f,
                "pipeline {} is leased by {} until {}",
                pipeline_id, holder, expires_at_ms
            ),
            PositionStoreError::LeaseLost {
                pipeline_id,
                reason,
            } => write!(f, "lease for pipeline {} lost: {}", pipeline_id, reason),
            PositionStoreError::Regression {
                sink,
                stored,
                attempted,
            } => match sink {
                Some(sink) => write!(
                    f,
                    "sink {} position would regress from {} to {:?}",
                    sink, stored, attempted
                ),
                None => write!(
                    f,
                    "confirmed position would regress from {} to {:?}",
                    stored, attempted
                ),
            },
        }
    }
}

impl std::error::Error for PositionStoreError {}

impl From<IoError> for PositionStoreError {
    fn from(e: IoError) -> Self {
        PositionStoreError::Io(e)
    }
}

impl From<serde_json::Error> for PositionStoreError {
    fn from(e: serde_json::Error) -> Self {
        PositionStoreError::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, PositionStoreError>;

/// Durable checkpoint record for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    /// Every sink has durably applied every routed event at or below this.
    pub last_confirmed_position: Option<Position>,
    /// Table (`schema.table`) to bound sinks, as configured when written.
    pub sink_bindings: BTreeMap<String, BTreeSet<SinkId>>,
    /// Per-sink durable watermarks. Each is >= `last_confirmed_position`.
    #[serde(default)]
    pub sink_positions: BTreeMap<SinkId, Position>,
    pub version: u64,
    #[serde(default)]
    pub lease_epoch: u64,
    pub updated_at_ms: u64,
}

impl PipelineState {
    pub fn new(
        pipeline_id: impl Into<String>,
        sink_bindings: BTreeMap<String, BTreeSet<SinkId>>,
    ) -> Self {
        PipelineState {
            pipeline_id: pipeline_id.into(),
            last_confirmed_position: None,
            sink_bindings,
            sink_positions: BTreeMap::new(),
            version: 0,
            lease_epoch: 0,
            updated_at_ms: 0,
        }
    }

    /// Where `sink` should resume: its own watermark if newer than the
    /// global one.
    pub fn sink_resume_position(&self, sink: &SinkId) -> Option<Position> {
        let own = self.sink_positions.get(sink).copied();
        match (own, self.last_confirmed_position) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        if let Some(confirmed) = self.last_confirmed_position {
            for (sink, pos) in &self.sink_positions {
                debug_assert!(
                    *pos >= confirmed,
                    "sink {} watermark {} below confirmed {}",
                    sink,
                    pos,
                    confirmed
                );
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    pipeline_id: String,
    owner: String,
    epoch: u64,
    acquired_at_ms: u64,
    expires_at_ms: u64,
}

/// Proof of exclusive ownership of a pipeline's checkpoint record.
#[derive(Debug, Clone)]
pub struct Lease {
    pipeline_id: String,
    owner: String,
    epoch: u64,
    expires_at: Timestamp,
    etag: String,
}

impl Lease {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fencing token; strictly increases across holders.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }
}

pub struct PositionStore {
    store: SharedStore,
    prefix: String,
    clock: SharedClock,
    ttl: Duration,
}

impl PositionStore {
    pub fn new(store: SharedStore, prefix: impl Into<String>, clock: SharedClock, ttl: Duration) -> Self {
        PositionStore {
            store,
            prefix: prefix.into(),
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lease_key(&self, pipeline_id: &str) -> String {
        format!("{}/{}/lease.json", self.prefix, pipeline_id)
    }

    fn state_key(&self, pipeline_id: &str) -> String {
        format!("{}/{}/state.json", self.prefix, pipeline_id)
    }

    fn lost(lease: &Lease, reason: impl Into<String>) -> PositionStoreError {
        PositionStoreError::LeaseLost {
            pipeline_id: lease.pipeline_id.clone(),
            reason: reason.into(),
        }
    }

    /// Take the lease for `pipeline_id`. Fails with `LeaseConflict` while
    /// any unexpired lease is on file, including one recorded under the same
    /// owner name: only the `Lease` handle returned here may renew it.
    pub async fn acquire(&self, pipeline_id: &str, owner: &str) -> Result<Lease> {
        let key = self.lease_key(pipeline_id);
        let now = self.clock.now();
        let existing = self.store.get_versioned(&key).await?;

        let (epoch, condition) = match existing {
            None => (1, PutCondition::Absent),
            Some((data, etag)) => {
                let current: LeaseRecord = serde_json::from_slice(&data)?;
                if current.expires_at_ms > now.as_millis() {
                    return Err(PositionStoreError::LeaseConflict {
                        pipeline_id: pipeline_id.to_string(),
                        holder: current.owner,
                        expires_at_ms: current.expires_at_ms,
                    });
                }
                if current.owner != owner {
                    info!(
                        pipeline_id,
                        previous = %current.owner,
                        previous_epoch = current.epoch,
                        "Taking over expired lease"
                    );
                }
                (current.epoch + 1, PutCondition::Matches(etag))
            }
        };

        let expires_at = now + self.ttl;
        let record = LeaseRecord {
            pipeline_id: pipeline_id.to_string(),
            owner: owner.to_string(),
            epoch,
            acquired_at_ms: now.as_millis(),
            expires_at_ms: expires_at.as_millis(),
        };
        let data = serde_json::to_vec(&record)?;
        match self.store.put_if(&key, &data, &condition).await? {
            Some(etag) => {
                info!(pipeline_id, owner, epoch, "Acquired pipeline lease");
                Ok(Lease {
                    pipeline_id: pipeline_id.to_string(),
                    owner: owner.to_string(),
                    epoch,
                    expires_at,
                    etag,
                })
            }
            None => Err(PositionStoreError::LeaseConflict {
                pipeline_id: pipeline_id.to_string(),
                holder: "concurrent acquirer".to_string(),
                expires_at_ms: expires_at.as_millis(),
            }),
        }
    }

    /// Check that `lease` is still the record on file. Returns its etag.
    async fn verify(&self, lease: &Lease) -> Result<String> {
        let key = self.lease_key(&lease.pipeline_id);
        let Some((data, etag)) = self.store.get_versioned(&key).await? else {
            return Err(Self::lost(lease, "lease record missing"));
        };
        if etag != lease.etag {
            let current: LeaseRecord = serde_json::from_slice(&data)?;
            return Err(Self::lost(
                lease,
                format!("now held by {} (epoch {})", current.owner, current.epoch),
            ));
        }
        Ok(etag)
    }

    /// Extend the lease by one TTL from now.
    pub async fn renew(&self, lease: &mut Lease) -> Result<()> {
        let etag = self.verify(lease).await?;
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let record = LeaseRecord {
            pipeline_id: lease.pipeline_id.clone(),
            owner: lease.owner.clone(),
            epoch: lease.epoch,
            acquired_at_ms: now.as_millis(),
            expires_at_ms: expires_at.as_millis(),
        };
        let data = serde_json::to_vec(&record)?;
        let key = self.lease_key(&lease.pipeline_id);
        match self
            .store
            .put_if(&key, &data, &PutCondition::Matches(etag))
            .await?
        {
            Some(new_etag) => {
                lease.etag = new_etag;
                lease.expires_at = expires_at;
                debug!(pipeline_id = %lease.pipeline_id, expires_at_ms = expires_at.as_millis(), "Renewed lease");
                Ok(())
            }
            None => Err(Self::lost(lease, "lease changed during renewal")),
        }
    }

    /// Give the lease up so another instance can start immediately.
    pub async fn release(&self, lease: Lease) -> Result<()> {
        let etag = match self.verify(&lease).await {
            Ok(etag) => etag,
            Err(PositionStoreError::LeaseLost { reason, .. }) => {
                debug!(pipeline_id = %lease.pipeline_id, reason, "Lease already gone at release");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let record = LeaseRecord {
            pipeline_id: lease.pipeline_id.clone(),
            owner: lease.owner.clone(),
            epoch: lease.epoch,
            acquired_at_ms: 0,
            expires_at_ms: 0,
        };
        let data = serde_json::to_vec(&record)?;
        let key = self.lease_key(&lease.pipeline_id);
        self.store
            .put_if(&key, &data, &PutCondition::Matches(etag))
            .await?;
        info!(pipeline_id = %lease.pipeline_id, epoch = lease.epoch, "Released pipeline lease");
        Ok(())
    }

    /// Last committed state, if any.
    pub async fn load(&self, pipeline_id: &str) -> Result<Option<PipelineState>> {
        match self.store.get_versioned(&self.state_key(pipeline_id)).await? {
            Some((data, _)) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Durably replace the pipeline state. Positions may only move forward.
    /// Returns the state as stored, with version and timestamps filled in.
    pub async fn commit(&self, lease: &Lease, state: &PipelineState) -> Result<PipelineState> {
        let now = self.clock.now();
        if now >= lease.expires_at {
            return Err(Self::lost(lease, "lease expired before commit"));
        }
        self.verify(lease).await?;

        let key = self.state_key(&lease.pipeline_id);
        let existing = self.store.get_versioned(&key).await?;
        let (stored, condition) = match existing {
            Some((data, etag)) => {
                let stored: PipelineState = serde_json::from_slice(&data)?;
                (Some(stored), PutCondition::Matches(etag))
            }
            None => (None, PutCondition::Absent),
        };

        let mut next = state.clone();
        next.pipeline_id = lease.pipeline_id.clone();
        next.lease_epoch = lease.epoch;
        next.updated_at_ms = now.as_millis();
        next.version = 1;

        if let Some(stored) = &stored {
            if stored.lease_epoch > lease.epoch {
                return Err(Self::lost(
                    lease,
                    format!("state written by newer epoch {}", stored.lease_epoch),
                ));
            }
            if let Some(prev) = stored.last_confirmed_position {
                if next.last_confirmed_position.map_or(true, |p| p < prev) {
                    return Err(PositionStoreError::Regression {
                        sink: None,
                        stored: prev,
                        attempted: next.last_confirmed_position,
                    });
                }
            }
            for (sink, prev) in &stored.sink_positions {
                match next.sink_positions.get(sink) {
                    Some(p) if p < prev => {
                        return Err(PositionStoreError::Regression {
                            sink: Some(sink.clone()),
                            stored: *prev,
                            attempted: Some(*p),
                        })
                    }
                    Some(_) => {}
                    None => {
                        warn!(sink = %sink, "Sink missing from commit; keeping stored watermark");
                        next.sink_positions.insert(sink.clone(), *prev);
                    }
                }
            }
            next.version = stored.version + 1;
        }

        #[cfg(debug_assertions)]
        next.verify_invariants();

        let data = serde_json::to_vec_pretty(&next)?;
        match self.store.put_if(&key, &data, &condition).await? {
            Some(_) => {
                debug!(
                    pipeline_id = %next.pipeline_id,
                    version = next.version,
                    position = ?next.last_confirmed_position,
                    "Committed pipeline state"
                );
                Ok(next)
            }
            None => Err(Self::lost(lease, "state modified concurrently")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::store::InMemoryObjectStore;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(10);

    fn setup() -> (PositionStore, SimulatedClock, InMemoryObjectStore) {
        let clock = SimulatedClock::new(1_000);
        let store = InMemoryObjectStore::new();
        let positions = PositionStore::new(Arc::new(store.clone()), "pipelines", Arc::new(clock.clone()), TTL);
        (positions, clock, store)
    }

    fn state_at(position: u64) -> PipelineState {
        let mut state = PipelineState::new("p1", BTreeMap::new());
        state.last_confirmed_position = Some(Position(position));
        state
    }

    #[tokio::test]
    async fn test_acquire_and_conflict() {
        let (positions, _clock, _) = setup();
        let lease = positions.acquire("p1", "a").await.unwrap();
        assert_eq!(lease.epoch(), 1);

        let err = positions.acquire("p1", "b").await.unwrap_err();
        assert!(matches!(err, PositionStoreError::LeaseConflict { ref holder, .. } if holder == "a"));
    }

    #[tokio::test]
    async fn test_same_owner_name_cannot_reacquire_live_lease() {
        let (positions, clock, _) = setup();
        let first = positions.acquire("p1", "a").await.unwrap();

        let err = positions.acquire("p1", "a").await.unwrap_err();
        assert!(matches!(err, PositionStoreError::LeaseConflict { ref holder, .. } if holder == "a"));

        // The original handle is untouched and keeps committing.
        positions.commit(&first, &state_at(3)).await.unwrap();

        clock.advance(TTL + Duration::from_millis(1));
        let second = positions.acquire("p1", "a").await.unwrap();
        assert_eq!(second.epoch(), 2);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (positions, clock, _) = setup();
        let old = positions.acquire("p1", "a").await.unwrap();
        clock.advance(TTL + Duration::from_millis(1));

        let new = positions.acquire("p1", "b").await.unwrap();
        assert_eq!(new.epoch(), old.epoch() + 1);

        let err = positions.commit(&old, &state_at(5)).await.unwrap_err();
        assert!(matches!(err, PositionStoreError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_commit_after_takeover() {
        let (positions, clock, _) = setup();
        let mut old = positions.acquire("p1", "a").await.unwrap();
        clock.advance(TTL + Duration::from_millis(1));
        let _new = positions.acquire("p1", "b").await.unwrap();

        assert!(positions.renew(&mut old).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_then_load() {
        let (positions, _clock, _) = setup();
        let lease = positions.acquire("p1", "a").await.unwrap();
        assert!(positions.load("p1").await.unwrap().is_none());

        let mut state = state_at(12);
        state.sink_positions.insert(SinkId::from("s1"), Position(15));
        let stored = positions.commit(&lease, &state).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.lease_epoch, 1);

        let loaded = positions.load("p1").await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert_eq!(loaded.sink_resume_position(&SinkId::from("s1")), Some(Position(15)));
        assert_eq!(loaded.sink_resume_position(&SinkId::from("other")), Some(Position(12)));
    }

    #[tokio::test]
    async fn test_commit_rejects_regression() {
        let (positions, _clock, _) = setup();
        let lease = positions.acquire("p1", "a").await.unwrap();
        positions.commit(&lease, &state_at(20)).await.unwrap();

        let err = positions.commit(&lease, &state_at(19)).await.unwrap_err();
        assert!(matches!(err, PositionStoreError::Regression { sink: None, .. }));

        let second = positions.commit(&lease, &state_at(20)).await.unwrap();
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn test_commit_after_expiry_rejected() {
        let (positions, clock, _) = setup();
        let lease = positions.acquire("p1", "a").await.unwrap();
        clock.advance(TTL);
        let err = positions.commit(&lease, &state_at(1)).await.unwrap_err();
        assert!(matches!(err, PositionStoreError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_renew_extends_and_release_frees() {
        let (positions, clock, _) = setup();
        let mut lease = positions.acquire("p1", "a").await.unwrap();
        let first_expiry = lease.expires_at();
        clock.advance(Duration::from_secs(5));
        positions.renew(&mut lease).await.unwrap();
        assert!(lease.expires_at() > first_expiry);

        positions.release(lease).await.unwrap();
        let other = positions.acquire("p1", "b").await.unwrap();
        assert_eq!(other.epoch(), 2);
    }

    #[tokio::test]
    async fn test_new_holder_resumes_from_committed_state() {
        let (positions, clock, _) = setup();
        let old = positions.acquire("p1", "a").await.unwrap();
        positions.commit(&old, &state_at(42)).await.unwrap();
        clock.advance(TTL * 2);

        let new = positions.acquire("p1", "b").await.unwrap();
        let state = positions.load("p1").await.unwrap().unwrap();
        assert_eq!(state.last_confirmed_position, Some(Position(42)));
        let stored = positions.commit(&new, &state_at(50)).await.unwrap();
        assert_eq!(stored.lease_epoch, 2);
    }
}
