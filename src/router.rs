//! Router: fan events out to the sinks bound to their table.

use crate::event::{ChangeEvent, TableId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Configured sink identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkId(pub String);

impl SinkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkId {
    fn from(s: &str) -> Self {
        SinkId(s.to_string())
    }
}

impl From<String> for SinkId {
    fn from(s: String) -> Self {
        SinkId(s)
    }
}

/// Table to sink mapping. Sinks per table are kept sorted and unique, so
/// fan-out order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkBindings {
    by_table: BTreeMap<TableId, Vec<SinkId>>,
}

impl SinkBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, table: TableId, sink: SinkId) -> &mut Self {
        let sinks = self.by_table.entry(table).or_default();
        if let Err(idx) = sinks.binary_search(&sink) {
            sinks.insert(idx, sink);
        }
        self
    }

    pub fn with(mut self, table: TableId, sink: impl Into<SinkId>) -> Self {
        self.bind(table, sink.into());
        self
    }

    pub fn sinks_for(&self, table: &TableId) -> &[SinkId] {
        self.by_table.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.by_table.keys()
    }

    pub fn tables_for(&self, sink: &SinkId) -> Vec<TableId> {
        self.by_table
            .iter()
            .filter(|(_, sinks)| sinks.contains(sink))
            .map(|(table, _)| table.clone())
            .collect()
    }

    /// Every sink referenced by any binding.
    pub fn sinks(&self) -> BTreeSet<SinkId> {
        self.by_table.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }

    /// Form stored in the checkpoint record.
    pub fn to_persisted(&self) -> BTreeMap<String, BTreeSet<SinkId>> {
        self.by_table
            .iter()
            .map(|(table, sinks)| (table.to_string(), sinks.iter().cloned().collect()))
            .collect()
    }

    pub fn matches_persisted(&self, persisted: &BTreeMap<String, BTreeSet<SinkId>>) -> bool {
        self.to_persisted() == *persisted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub unrouted: u64,
    pub deliveries: u64,
}

pub struct Router {
    bindings: Arc<SinkBindings>,
    stats: RouterStats,
}

impl Router {
    pub fn new(bindings: Arc<SinkBindings>) -> Self {
        Router {
            bindings,
            stats: RouterStats::default(),
        }
    }

    /// One delivery per bound sink, in sink id order. An empty result means
    /// no sink is bound; the event still counts as processed.
    pub fn route(&mut self, event: Arc<ChangeEvent>) -> Vec<(SinkId, Arc<ChangeEvent>)> {
        let sinks = self.bindings.sinks_for(&event.table_id);
        if sinks.is_empty() {
            self.stats.unrouted += 1;
            return Vec::new();
        }
        self.stats.routed += 1;
        self.stats.deliveries += sinks.len() as u64;
        sinks
            .iter()
            .map(|sink| (sink.clone(), Arc::clone(&event)))
            .collect()
    }

    pub fn bindings(&self) -> &SinkBindings {
        &self.bindings
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }
}
