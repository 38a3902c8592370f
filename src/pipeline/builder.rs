//! Assembles a pipeline from configuration plus injected parts.
//!
//! Anything not injected is built from the configuration: the source is
//! the file change log (or the buffered topic when transport is enabled)
//! and sinks write to the object store under their configured prefix.

use super::config::{ConfigError, PipelineConfig, SinkConfig};
use super::coordinator::{self, PipelineHandle, PipelineParts};
use super::PipelineError;
use crate::clock::{ProductionClock, SharedClock};
use crate::router::SinkId;
use crate::sink::{
    AppendLogSink, BoxedSink, ObjectStoreAppendLog, ObjectStoreBulkIngest,
    ObjectStoreKeyedTable, OlapBatchLimits, OlapNativeSink, SinkKind, UpsertTableSink,
};
use crate::source::{FileChangeLog, SharedSource};
use crate::store::SharedStore;
use crate::transport::TopicSource;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<SharedSource>,
    state_store: Option<SharedStore>,
    sink_store: Option<SharedStore>,
    clock: Option<SharedClock>,
    writers: BTreeMap<SinkId, BoxedSink>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        PipelineBuilder {
            config,
            source: None,
            state_store: None,
            sink_store: None,
            clock: None,
            writers: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn source(mut self, source: SharedSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Store holding leases and checkpoint records.
    pub fn state_store(mut self, store: SharedStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Store that configured sinks without an injected writer write to.
    /// Defaults to the state store.
    pub fn sink_store(mut self, store: SharedStore) -> Self {
        self.sink_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `writer` for the configured sink with the same id.
    pub fn writer(mut self, writer: BoxedSink) -> Self {
        self.writers.insert(writer.id().clone(), writer);
        self
    }

    pub async fn start(self) -> Result<PipelineHandle, PipelineError> {
        let PipelineBuilder {
            config,
            source,
            state_store,
            sink_store,
            clock,
            mut writers,
        } = self;
        config.validate()?;

        let clock = clock.unwrap_or_else(ProductionClock::shared);
        let state_store = state_store.ok_or_else(|| {
            PipelineError::Config(ConfigError::Invalid("no position store configured".into()))
        })?;
        let sink_store = sink_store.unwrap_or_else(|| state_store.clone());

        for id in writers.keys() {
            if config.sink(id).is_none() {
                return Err(PipelineError::Config(ConfigError::Invalid(format!(
                    "writer supplied for unconfigured sink {}",
                    id
                ))));
            }
        }

        let mut built = Vec::with_capacity(config.sinks.len());
        for sink in &config.sinks {
            let writer = match writers.remove(&sink.id) {
                Some(writer) => writer,
                None => writer_from_config(sink, sink_store.clone(), clock.clone()),
            };
            if writer.kind() != sink.kind {
                return Err(PipelineError::Config(ConfigError::Invalid(format!(
                    "sink {} is configured as {} but its writer is {}",
                    sink.id,
                    sink.kind,
                    writer.kind()
                ))));
            }
            built.push(writer);
        }

        let source: SharedSource = match source {
            Some(source) => source,
            None if config.transport.enabled => {
                Arc::new(TopicSource::open(
                    sink_store.clone(),
                    &config.transport,
                    config.pipeline_id.clone(),
                )?)
            }
            None => Arc::new(FileChangeLog::open(config.source.clone())?),
        };

        coordinator::start(PipelineParts {
            config,
            source,
            state_store,
            clock,
            writers: built,
        })
        .await
    }
}

/// Object-store backed writer for one configured sink.
pub fn writer_from_config(config: &SinkConfig, store: SharedStore, clock: SharedClock) -> BoxedSink {
    let prefix = config.store_prefix();
    match config.kind {
        SinkKind::UpsertTable => {
            let mut sink = UpsertTableSink::new(
                config.id.clone(),
                ObjectStoreKeyedTable::new(store, &prefix),
            )
            .with_schema_policy(config.schema_policy)
            .with_tombstone_pruning(config.prune_tombstones);
            for (table, columns) in &config.key_columns {
                sink = sink.with_key_columns(table.clone(), columns.clone());
            }
            for (table, columns) in &config.columns {
                sink = sink.with_columns(table.clone(), columns.iter().cloned());
            }
            Box::new(sink)
        }
        SinkKind::AppendLog => Box::new(AppendLogSink::new(
            config.id.clone(),
            ObjectStoreAppendLog::new(store, &prefix),
        )),
        SinkKind::OlapNative => Box::new(OlapNativeSink::new(
            config.id.clone(),
            ObjectStoreBulkIngest::new(store, &prefix),
            OlapBatchLimits {
                max_batch_rows: config.max_batch_rows,
                max_batch_age: config.max_batch_age,
            },
            clock,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TableId;
    use crate::sink::{InMemoryAppendLog, SinkWriter};
    use crate::store::InMemoryObjectStore;

    #[test]
    fn test_writer_from_config_kinds() {
        let store: SharedStore = Arc::new(InMemoryObjectStore::new());
        let clock = ProductionClock::shared();
        for kind in [SinkKind::UpsertTable, SinkKind::AppendLog, SinkKind::OlapNative] {
            let config = SinkConfig::new("s", kind);
            let writer = writer_from_config(&config, store.clone(), clock.clone());
            assert_eq!(writer.kind(), kind);
            assert_eq!(writer.id(), &SinkId::from("s"));
        }
    }

    #[tokio::test]
    async fn test_rejects_writer_for_unknown_sink() {
        let config = PipelineConfig::test("p")
            .with_sink(SinkConfig::new("a", SinkKind::AppendLog))
            .bind(TableId::new("s", "t"), "a");
        let result = PipelineBuilder::new(config)
            .state_store(Arc::new(InMemoryObjectStore::new()))
            .writer(Box::new(AppendLogSink::new("zzz", InMemoryAppendLog::new())))
            .start()
            .await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_rejects_kind_mismatch() {
        let config = PipelineConfig::test("p")
            .with_sink(SinkConfig::new("a", SinkKind::UpsertTable))
            .bind(TableId::new("s", "t"), "a");
        let result = PipelineBuilder::new(config)
            .state_store(Arc::new(InMemoryObjectStore::new()))
            .writer(Box::new(AppendLogSink::new("a", InMemoryAppendLog::new())))
            .start()
            .await;
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("configured as upsert_table"), "{}", err);
    }
}
