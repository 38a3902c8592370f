//! Partitioned, retained topic over an object store.
//!
//! Layout under `topics/{name}/`:
//!
//! ```text
//! topics/changes/0000/manifest.json
//! topics/changes/0000/00000000000000000000.seg
//! topics/changes/0000/00000000000000000001.seg
//! topics/changes/0001/manifest.json
//! ```
//!
//! Records keep their source position, so a partition is a sparse,
//! strictly increasing subsequence of the source log. Publishing skips
//! records at or below the partition's last position, which makes
//! re-publishing after a crash harmless.

use super::manifest::{ManifestStore, PartitionManifest, SegmentInfo};
use super::segment::{decode_segment, encode_segment, Compression};
use super::source::TopicSource;
use super::TransportError;
use crate::decode::EventDecoder;
use crate::event::{ChangeEvent, Position, RawChangeRecord, TableId};
use crate::pipeline::config::TransportConfig;
use crate::store::SharedStore;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub name: String,
    pub partitions: u32,
    pub retention_records: u64,
    pub segment_records: usize,
    pub compression: Compression,
    pub poll_interval: Duration,
}

impl TopicConfig {
    pub fn from_transport(config: &TransportConfig) -> Self {
        TopicConfig {
            name: config.topic.clone(),
            partitions: config.partitions,
            retention_records: config.retention_records,
            segment_records: config.segment_records,
            compression: Compression::from_setting(config.compression),
            poll_interval: config.poll_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub published: u64,
    /// Already present from an earlier publish.
    pub skipped: u64,
    pub segments_written: u64,
    pub segments_dropped: u64,
}

pub struct Topic {
    store: SharedStore,
    config: TopicConfig,
    manifests: Vec<ManifestStore>,
    /// One publisher at a time within this process.
    publish_lock: Mutex<()>,
    published: Notify,
}

impl Topic {
    pub fn new(store: SharedStore, config: TopicConfig) -> Result<Self, TransportError> {
        if config.partitions == 0 {
            return Err(TransportError::Config("topic needs at least one partition".into()));
        }
        if config.name.is_empty() || config.name.contains('/') {
            return Err(TransportError::Config(format!(
                "invalid topic name {:?}",
                config.name
            )));
        }
        let manifests = (0..config.partitions)
            .map(|p| ManifestStore::new(store.clone(), &partition_prefix(&config.name, p)))
            .collect();
        Ok(Topic {
            store,
            config,
            manifests,
            publish_lock: Mutex::new(()),
            published: Notify::new(),
        })
    }

    pub fn open(store: SharedStore, config: &TransportConfig) -> Result<Arc<Self>, TransportError> {
        Self::new(store, TopicConfig::from_transport(config)).map(Arc::new)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn partitions(&self) -> u32 {
        self.config.partitions
    }

    /// Partition for a table: crc32 of `schema.table` modulo partitions.
    pub fn partition_for(&self, table: &TableId) -> u32 {
        crc32fast::hash(table.to_string().as_bytes()) % self.config.partitions
    }

    pub(crate) fn published(&self) -> &Notify {
        &self.published
    }

    fn manifest_store(&self, partition: u32) -> Result<&ManifestStore, TransportError> {
        self.manifests
            .get(partition as usize)
            .ok_or(TransportError::InvalidPartition {
                partition,
                partitions: self.config.partitions,
            })
    }

    /// Current manifest; empty if nothing was ever published.
    pub async fn manifest(&self, partition: u32) -> Result<PartitionManifest, TransportError> {
        let manifests = self.manifest_store(partition)?;
        Ok(manifests
            .load()
            .await?
            .unwrap_or_else(|| PartitionManifest::new(self.config.name.clone(), partition)))
    }

    /// Append events, in position order, to their partitions.
    pub async fn publish(&self, events: &[ChangeEvent]) -> Result<PublishOutcome, TransportError> {
        let _guard = self.publish_lock.lock().await;
        let mut by_partition: BTreeMap<u32, Vec<RawChangeRecord>> = BTreeMap::new();
        for event in events {
            by_partition
                .entry(self.partition_for(&event.table_id))
                .or_default()
                .push(EventDecoder::encode(event));
        }

        let mut outcome = PublishOutcome::default();
        for (partition, records) in by_partition {
            self.publish_partition(partition, records, &mut outcome).await?;
        }
        if outcome.published > 0 {
            self.published.notify_waiters();
        }
        Ok(outcome)
    }

    async fn publish_partition(
        &self,
        partition: u32,
        records: Vec<RawChangeRecord>,
        outcome: &mut PublishOutcome,
    ) -> Result<(), TransportError> {
        let manifests = self.manifest_store(partition)?;
        let mut manifest = self.manifest(partition).await?;

        let offered = records.len() as u64;
        let fresh: Vec<RawChangeRecord> = records
            .into_iter()
            .filter(|r| manifest.last_position.map_or(true, |last| r.position > last))
            .collect();
        outcome.skipped += offered - fresh.len() as u64;
        if fresh.is_empty() {
            return Ok(());
        }

        let prefix = partition_prefix(&self.config.name, partition);
        for chunk in fresh.chunks(self.config.segment_records.max(1)) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            let id = manifest.allocate_segment_id();
            let key = format!("{}/{:020}.seg", prefix, id);
            let data = encode_segment(chunk, self.config.compression).map_err(|source| {
                TransportError::Segment {
                    key: key.clone(),
                    source,
                }
            })?;
            self.store.put(&key, &data).await?;
            manifest.add_segment(SegmentInfo {
                id,
                key,
                first_position: first.position,
                last_position: last.position,
                record_count: chunk.len() as u32,
                size_bytes: data.len() as u64,
            });
            outcome.segments_written += 1;
        }

        let dropped = manifest.apply_retention(self.config.retention_records);
        manifests.save(&manifest).await?;
        outcome.published += fresh.len() as u64;
        outcome.segments_dropped += dropped.len() as u64;

        for segment in &dropped {
            if let Err(e) = self.store.delete(&segment.key).await {
                warn!(key = %segment.key, error = %e, "Failed to delete expired segment");
            }
        }
        if let Some(through) = manifest.dropped_through.filter(|_| !dropped.is_empty()) {
            info!(
                topic = %self.config.name,
                partition,
                segments = dropped.len(),
                through = %through,
                "Retention dropped segments"
            );
        }
        debug!(
            topic = %self.config.name,
            partition,
            records = fresh.len(),
            last = ?manifest.last_position,
            "Published to partition"
        );
        Ok(())
    }

    /// Up to roughly `max_records` records of `partition` after `after`
    /// (whole segments are returned, so the batch may run over).
    pub async fn read(
        &self,
        partition: u32,
        after: Option<Position>,
        max_records: usize,
    ) -> Result<Vec<RawChangeRecord>, TransportError> {
        let manifest = self.manifest(partition).await?;
        if let (Some(requested), Some(dropped)) = (after, manifest.dropped_through) {
            if requested < dropped {
                return Err(TransportError::PositionLost {
                    partition,
                    requested,
                    earliest: manifest.earliest_position(),
                });
            }
        }

        let mut out = Vec::new();
        for segment in manifest.segments_after(after) {
            let data = match self.store.get(&segment.key).await {
                Ok(data) => data,
                // Retention removed it after we loaded the manifest.
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let current = self.manifest(partition).await?;
                    return Err(TransportError::PositionLost {
                        partition,
                        requested: after.unwrap_or(Position::ZERO),
                        earliest: current.earliest_position(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let (_, records) = decode_segment(&data).map_err(|source| TransportError::Segment {
                key: segment.key.clone(),
                source,
            })?;
            out.extend(
                records
                    .into_iter()
                    .filter(|r| after.map_or(true, |a| r.position > a)),
            );
            if out.len() >= max_records {
                break;
            }
        }
        Ok(out)
    }

    pub async fn head(&self, partition: u32) -> Result<Option<Position>, TransportError> {
        Ok(self.manifest(partition).await?.last_position)
    }

    pub async fn earliest(&self, partition: u32) -> Result<Option<Position>, TransportError> {
        Ok(self.manifest(partition).await?.earliest_position())
    }

    /// A source reading one partition. Each consumer group is its own
    /// pipeline with its own stored position; the group name only labels
    /// the stream.
    pub fn subscribe(
        self: &Arc<Self>,
        partition: u32,
        group: impl Into<String>,
    ) -> Result<TopicSource, TransportError> {
        self.manifest_store(partition)?;
        Ok(TopicSource::new(self.clone(), partition, group))
    }
}

fn partition_prefix(topic: &str, partition: u32) -> String {
    format!("topics/{}/{:04}", topic, partition)
}
