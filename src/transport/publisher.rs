//! TopicPublisher: source log to topic.
//!
//! Reads the source through a [`LogReader`], validates records with the
//! decoder and publishes them in batches. Its own resume position lives in
//! the position store under `{pipeline}-publisher`, committed after each
//! batch is in the topic. A crash between publish and commit re-publishes
//! the batch, which the topic skips.

use super::topic::{PublishOutcome, Topic};
use super::TransportError;
use crate::clock::{SharedClock, Timestamp};
use crate::decode::EventDecoder;
use crate::event::{ChangeEvent, Position, StartPosition};
use crate::io::ProductionRng;
use crate::pipeline::config::PipelineConfig;
use crate::position::{Lease, PipelineState, PositionStore};
use crate::retry::RetryPolicy;
use crate::source::{LogReader, SharedSource, SourceError};
use crate::store::SharedStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a partial batch waits for more records.
const LINGER: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub batches: u64,
    pub published: u64,
    /// Already in the topic from before a restart.
    pub republished_skipped: u64,
    pub undecodable_skipped: u64,
    pub position: Option<Position>,
}

pub struct TopicPublisher {
    id: String,
    topic: Arc<Topic>,
    reader: LogReader,
    decoder: EventDecoder,
    store: PositionStore,
    lease: Option<Lease>,
    state: PipelineState,
    clock: SharedClock,
    retry: RetryPolicy,
    batch_max: usize,
    last_renewal: Timestamp,
    rng: ProductionRng,
    stats: PublisherStats,
}

impl TopicPublisher {
    /// Take the publisher lease, load its position and open the source.
    pub async fn start(
        config: &PipelineConfig,
        source: SharedSource,
        topic: Arc<Topic>,
        state_store: SharedStore,
        clock: SharedClock,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let id = format!("{}-publisher", config.pipeline_id);
        let store = PositionStore::new(
            state_store,
            config.lease.prefix.clone(),
            clock.clone(),
            config.lease.ttl,
        );
        let lease = store.acquire(&id, &config.lease.owner_name()).await?;

        let state = match store.load(&id).await {
            Ok(Some(state)) => state,
            Ok(None) => PipelineState::new(id.clone(), BTreeMap::new()),
            Err(e) => {
                release_after_failed_start(&store, lease, &id).await;
                return Err(e.into());
            }
        };
        let from = match state.last_confirmed_position {
            Some(p) => StartPosition::At(p),
            None => config.start,
        };

        let mut reader = LogReader::new(source, config.source_retry.clone(), cancel);
        if let Err(e) = reader.open(from).await {
            release_after_failed_start(&store, lease, &id).await;
            return Err(e.into());
        }
        info!(publisher = %id, topic = %topic.name(), start = %from, "Publisher started");

        let now = clock.now();
        Ok(TopicPublisher {
            id,
            batch_max: topic.config().segment_records.max(1),
            topic,
            reader,
            decoder: EventDecoder::new(config.decode_failure),
            store,
            lease: Some(lease),
            state,
            clock,
            retry: config.sink_retry.clone(),
            last_renewal: now,
            rng: ProductionRng::new(),
            stats: PublisherStats::default(),
        })
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Publish until cancelled, then release the lease.
    pub async fn run(mut self) -> Result<PublisherStats, TransportError> {
        let result = self.publish_loop().await;
        self.reader.close();
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.store.release(lease).await {
                warn!(publisher = %self.id, error = %e, "Failed to release publisher lease");
            }
        }
        match result {
            Ok(()) => {
                info!(publisher = %self.id, published = self.stats.published, "Publisher stopped");
                Ok(self.stats)
            }
            Err(e) => {
                warn!(publisher = %self.id, error = %e, "Publisher failed");
                Err(e)
            }
        }
    }

    async fn publish_loop(&mut self) -> Result<(), TransportError> {
        loop {
            let (events, last) = match self.next_batch().await {
                Ok(batch) => batch,
                Err(TransportError::Source(SourceError::Cancelled)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Some(last) = last {
                let outcome = self.publish_with_retry(&events).await?;
                self.stats.batches += 1;
                self.stats.published += outcome.published;
                self.stats.republished_skipped += outcome.skipped;
                self.commit(last).await?;
            }
            self.renew_if_due().await?;
        }
    }

    /// Decoded events plus the last position read. Waits at most a third
    /// of the lease TTL for the first record so the lease stays renewed.
    async fn next_batch(&mut self) -> Result<(Vec<ChangeEvent>, Option<Position>), TransportError> {
        let mut events = Vec::new();
        let mut last = None;
        let mut wait = self.store.ttl() / 3;
        while events.len() < self.batch_max {
            let record = match tokio::time::timeout(wait, self.reader.next()).await {
                Ok(record) => record?,
                Err(_) => break,
            };
            wait = LINGER;
            last = Some(record.position);
            match self.decoder.decode_with_policy(&record)? {
                Some(event) => events.push(event),
                None => self.stats.undecodable_skipped += 1,
            }
        }
        Ok((events, last))
    }

    async fn publish_with_retry(&mut self, events: &[ChangeEvent]) -> Result<PublishOutcome, TransportError> {
        let mut attempt = 0;
        loop {
            match self.topic.publish(events).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && self.retry.allows(attempt + 1) => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt, &mut self.rng);
                    warn!(publisher = %self.id, attempt, error = %e, "Publish failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit(&mut self, position: Position) -> Result<(), TransportError> {
        let Some(lease) = &self.lease else {
            return Ok(());
        };
        let mut next = self.state.clone();
        next.last_confirmed_position = Some(position);
        match self.store.commit(lease, &next).await {
            Ok(stored) => {
                self.state = stored;
                self.stats.position = Some(position);
                debug!(publisher = %self.id, position = %position, "Publisher position committed");
                Ok(())
            }
            // The next batch's commit covers this one.
            Err(e) if e.is_transient() => {
                warn!(publisher = %self.id, error = %e, "Failed to commit publisher position");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_if_due(&mut self) -> Result<(), TransportError> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(());
        };
        if !self.clock.has_elapsed(self.last_renewal, self.store.ttl() / 3) {
            return Ok(());
        }
        match self.store.renew(lease).await {
            Ok(()) => {
                self.last_renewal = self.clock.now();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(publisher = %self.id, error = %e, "Publisher lease renewal failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn release_after_failed_start(store: &PositionStore, lease: Lease, id: &str) {
    if let Err(e) = store.release(lease).await {
        warn!(publisher = %id, error = %e, "Failed to release publisher lease after failed start");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ProductionClock;
    use crate::decode::EventDecoder;
    use crate::pipeline::config::TransportConfig;
    use crate::source::InMemoryChangeLog;
    use crate::store::InMemoryObjectStore;

    fn envelope(id: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schema": "public", "table": "orders", "op": "c",
            "after": {"id": id}, "primary_key": ["id"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_publisher_resumes_from_committed_position() {
        let store: SharedStore = Arc::new(InMemoryObjectStore::new());
        let log = Arc::new(InMemoryChangeLog::new());
        for id in 1..=5 {
            log.append(envelope(id), 0);
        }
        let config = PipelineConfig::test("orders");
        let topic = Topic::open(store.clone(), &TransportConfig::test()).unwrap();

        let cancel = CancellationToken::new();
        let publisher = TopicPublisher::start(
            &config,
            log.clone(),
            topic.clone(),
            store.clone(),
            ProductionClock::shared(),
            cancel.clone(),
        )
        .await
        .unwrap();
        let task = tokio::spawn(publisher.run());
        for _ in 0..200 {
            if topic.head(0).await.unwrap() == Some(Position(5)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.published, 5);

        for id in 6..=8 {
            log.append(envelope(id), 0);
        }
        let cancel = CancellationToken::new();
        let publisher = TopicPublisher::start(
            &config,
            log.clone(),
            topic.clone(),
            store.clone(),
            ProductionClock::shared(),
            cancel.clone(),
        )
        .await
        .unwrap();
        let task = tokio::spawn(publisher.run());
        for _ in 0..200 {
            if topic.head(0).await.unwrap() == Some(Position(8)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.republished_skipped, 0);

        let records = topic.read(0, None, 100).await.unwrap();
        assert_eq!(records.len(), 8);
        let first = EventDecoder::default().decode(&records[0]).unwrap();
        assert_eq!(first.table_id.table, "orders");
    }

    #[tokio::test]
    async fn test_failed_start_releases_lease() {
        let store: SharedStore = Arc::new(InMemoryObjectStore::new());
        let log = Arc::new(InMemoryChangeLog::new());
        let topic = Topic::open(store.clone(), &TransportConfig::test()).unwrap();

        let mut ahead = PipelineConfig::test("orders");
        ahead.start = StartPosition::At(Position(50));
        let err = TopicPublisher::start(
            &ahead,
            log.clone(),
            topic.clone(),
            store.clone(),
            ProductionClock::shared(),
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TransportError::Source(SourceError::PositionAhead { .. })));

        // No TTL wait: the failed start gave the lease back.
        let publisher = TopicPublisher::start(
            &PipelineConfig::test("orders"),
            log,
            topic,
            store,
            ProductionClock::shared(),
            CancellationToken::new(),
        )
        .await;
        assert!(publisher.is_ok());
    }
}
