//! Per-partition manifest.
//!
//! The manifest is the source of truth for which segments of a partition
//! exist. A segment object is written before the manifest references it,
//! and dropped segments are deleted only after the manifest stops
//! referencing them, so a reader that loaded any manifest version finds
//! every segment it lists (or a clean retention gap).
//!
//! Updates go to a temp key and are then renamed over the manifest key.

use crate::event::Position;
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u64,
    pub key: String,
    pub first_position: Position,
    pub last_position: Position,
    pub record_count: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionManifest {
    pub topic: String,
    pub partition: u32,
    /// Incremented on each update.
    pub version: u64,
    /// Live segments, sorted by id and by position.
    pub segments: Vec<SegmentInfo>,
    pub next_segment_id: u64,
    /// Highest position ever published to this partition.
    pub last_position: Option<Position>,
    /// Highest position removed by retention.
    pub dropped_through: Option<Position>,
}

impl PartitionManifest {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        PartitionManifest {
            topic: topic.into(),
            partition,
            version: 0,
            segments: Vec::new(),
            next_segment_id: 0,
            last_position: None,
            dropped_through: None,
        }
    }

    pub fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    pub fn add_segment(&mut self, info: SegmentInfo) {
        self.last_position = Some(info.last_position);
        self.segments.push(info);
        self.version += 1;

        #[cfg(debug_assertions)]
        self.verify_invariants();
    }

    pub fn retained_records(&self) -> u64 {
        self.segments.iter().map(|s| s.record_count as u64).sum()
    }

    /// Drop the oldest segments while more than `retention_records` would
    /// remain. The newest segment is always kept. Returns what was removed.
    pub fn apply_retention(&mut self, retention_records: u64) -> Vec<SegmentInfo> {
        let mut retained = self.retained_records();
        let mut dropped = Vec::new();
        while self.segments.len() > 1 {
            let oldest = self.segments[0].record_count as u64;
            if retained <= retention_records {
                break;
            }
            retained -= oldest;
            let segment = self.segments.remove(0);
            self.dropped_through = Some(segment.last_position);
            dropped.push(segment);
        }
        if !dropped.is_empty() {
            self.version += 1;
        }

        #[cfg(debug_assertions)]
        self.verify_invariants();

        dropped
    }

    /// Oldest position still readable.
    pub fn earliest_position(&self) -> Option<Position> {
        self.segments.first().map(|s| s.first_position)
    }

    /// Segments holding positions after `after`.
    pub fn segments_after(&self, after: Option<Position>) -> impl Iterator<Item = &SegmentInfo> {
        self.segments
            .iter()
            .filter(move |s| after.map_or(true, |a| s.last_position > a))
    }

    /// # Invariants
    /// - segments sorted by id and by position, without overlap
    /// - next_segment_id greater than every segment id
    /// - last_position equals the newest segment's last position
    /// - retention never dropped anything a live segment still holds
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        debug_assert!(
            self.segments.windows(2).all(|w| w[0].id < w[1].id
                && w[0].last_position < w[1].first_position),
            "segments must be ordered and disjoint"
        );
        for segment in &self.segments {
            debug_assert!(segment.first_position <= segment.last_position);
            debug_assert!(self.next_segment_id > segment.id);
        }
        if let Some(newest) = self.segments.last() {
            debug_assert_eq!(self.last_position, Some(newest.last_position));
        }
        if let (Some(dropped), Some(earliest)) = (self.dropped_through, self.earliest_position()) {
            debug_assert!(dropped < earliest, "dropped {} >= earliest {}", dropped, earliest);
        }
    }
}

/// Loads and saves one partition's manifest.
pub struct ManifestStore {
    store: SharedStore,
    key: String,
}

impl ManifestStore {
    pub fn new(store: SharedStore, partition_prefix: &str) -> Self {
        ManifestStore {
            store,
            key: format!("{}/manifest.json", partition_prefix),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn load(&self) -> std::io::Result<Option<PartitionManifest>> {
        match self.store.get(&self.key).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, manifest: &PartitionManifest) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(manifest)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let temp = format!("{}.tmp", self.key);
        self.store.put(&temp, &data).await?;
        self.store.rename(&temp, &self.key).await
    }
}
