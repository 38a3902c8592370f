//! Upsert table sink.
//!
//! Insert and update upsert the row under its primary key; delete leaves a
//! tombstone. Each stored row and tombstone records the source position that
//! wrote it, and a write at or below that position is a no-op. Replaying any
//! suffix of the stream therefore converges to the same table.

use super::{after_watermark, SinkError, SinkFuture, SinkKind, SinkWriter};
use crate::event::{ChangeEvent, Operation, Position, PrimaryKey, Row, TableId};
use crate::router::SinkId;
use crate::store::{SharedStore, StoreFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use tracing::{debug, info};

/// One keyed mutation. `row: None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedWrite {
    pub table: TableId,
    pub key: PrimaryKey,
    pub row: Option<Row>,
    pub position: Position,
    pub commit_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row: Option<Row>,
    pub position: Position,
    pub commit_timestamp: u64,
}

/// Keyed destination. Writes are staged until `commit`.
pub trait KeyedTable: Send + Sync + 'static {
    /// Stage writes whose position exceeds the key's stored position.
    /// Returns how many were applied.
    fn write_batch<'a>(&'a self, writes: &'a [KeyedWrite]) -> StoreFuture<'a, usize>;

    /// Make staged writes durable and record `watermark`.
    fn commit(&self, watermark: Position) -> StoreFuture<'_, ()>;

    /// Highest committed watermark.
    fn watermark(&self) -> StoreFuture<'_, Option<Position>>;

    /// Drop tombstones written at or below `up_to`. Returns how many went.
    fn prune_tombstones(&self, up_to: Position) -> StoreFuture<'_, usize>;
}

impl<T: KeyedTable + ?Sized> KeyedTable for Arc<T> {
    fn write_batch<'a>(&'a self, writes: &'a [KeyedWrite]) -> StoreFuture<'a, usize> {
        (**self).write_batch(writes)
    }

    fn commit(&self, watermark: Position) -> StoreFuture<'_, ()> {
        (**self).commit(watermark)
    }

    fn watermark(&self) -> StoreFuture<'_, Option<Position>> {
        (**self).watermark()
    }

    fn prune_tombstones(&self, up_to: Position) -> StoreFuture<'_, usize> {
        (**self).prune_tombstones(up_to)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyedSnapshot {
    watermark: Option<Position>,
    tables: BTreeMap<TableId, BTreeMap<PrimaryKey, StoredRow>>,
}

#[derive(Debug, Default)]
struct KeyedData {
    durable: KeyedSnapshot,
    staged: BTreeMap<(TableId, PrimaryKey), StoredRow>,
}

impl KeyedData {
    fn version(&self, table: &TableId, key: &PrimaryKey) -> Option<Position> {
        if let Some(row) = self.staged.get(&(table.clone(), key.clone())) {
            return Some(row.position);
        }
        self.durable
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| row.position)
    }

    fn stage(&mut self, writes: &[KeyedWrite]) -> usize {
        let mut applied = 0;
        for write in writes {
            if let Some(stored) = self.version(&write.table, &write.key) {
                if write.position <= stored {
                    continue;
                }
            }
            self.staged.insert(
                (write.table.clone(), write.key.clone()),
                StoredRow {
                    row: write.row.clone(),
                    position: write.position,
                    commit_timestamp: write.commit_timestamp,
                },
            );
            applied += 1;
        }
        applied
    }

    /// Durable state as it would be after committing at `watermark`.
    fn merged(&self, watermark: Position) -> KeyedSnapshot {
        let mut snapshot = self.durable.clone();
        for ((table, key), row) in &self.staged {
            snapshot
                .tables
                .entry(table.clone())
                .or_default()
                .insert(key.clone(), row.clone());
        }
        snapshot.watermark = snapshot.watermark.max(Some(watermark));
        snapshot
    }

    fn commit(&mut self, watermark: Position) {
        self.durable = self.merged(watermark);
        self.staged.clear();
    }

    fn prune(&mut self, up_to: Position) -> usize {
        let mut pruned = 0;
        for rows in self.durable.tables.values_mut() {
            let before = rows.len();
            rows.retain(|_, stored| stored.row.is_some() || stored.position > up_to);
            pruned += before - rows.len();
        }
        pruned
    }

    fn live_rows(&self, table: &TableId) -> BTreeMap<PrimaryKey, Row> {
        self.durable
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|(key, stored)| stored.row.clone().map(|row| (key.clone(), row)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory keyed table with separate staged and durable state.
///
/// Clones share state, so a test can keep a handle while the sink owns
/// another. `crash()` discards staged writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyedTable {
    inner: Arc<Mutex<KeyedData>>,
}

impl InMemoryKeyedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable live rows of `table`.
    pub fn rows(&self, table: &TableId) -> BTreeMap<PrimaryKey, Row> {
        self.inner.lock().live_rows(table)
    }

    pub fn get(&self, table: &TableId, key: &PrimaryKey) -> Option<StoredRow> {
        self.inner
            .lock()
            .durable
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    pub fn tombstone_count(&self) -> usize {
        self.inner
            .lock()
            .durable
            .tables
            .values()
            .flat_map(|rows| rows.values())
            .filter(|stored| stored.row.is_none())
            .count()
    }

    pub fn staged_len(&self) -> usize {
        self.inner.lock().staged.len()
    }

    /// Lose everything not committed.
    pub fn crash(&self) {
        self.inner.lock().staged.clear();
    }
}

impl KeyedTable for InMemoryKeyedTable {
    fn write_batch<'a>(&'a self, writes: &'a [KeyedWrite]) -> StoreFuture<'a, usize> {
        Box::pin(async move { Ok(self.inner.lock().stage(writes)) })
    }

    fn commit(&self, watermark: Position) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.inner.lock().commit(watermark);
            Ok(())
        })
    }

    fn watermark(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.inner.lock().durable.watermark) })
    }

    fn prune_tombstones(&self, up_to: Position) -> StoreFuture<'_, usize> {
        Box::pin(async move { Ok(self.inner.lock().prune(up_to)) })
    }
}

/// Keyed table persisted as one JSON snapshot object.
///
/// Commits write the merged snapshot to a temp key and rename it over the
/// live key, so a crash leaves either the old or the new snapshot.
pub struct ObjectStoreKeyedTable {
    store: SharedStore,
    snapshot_key: String,
    temp_key: String,
    data: Mutex<KeyedData>,
    loaded: Mutex<bool>,
}

impl ObjectStoreKeyedTable {
    pub fn new(store: SharedStore, prefix: &str) -> Self {
        ObjectStoreKeyedTable {
            store,
            snapshot_key: format!("{}/table.json", prefix),
            temp_key: format!("{}/table.json.tmp", prefix),
            data: Mutex::new(KeyedData::default()),
            loaded: Mutex::new(false),
        }
    }

    async fn ensure_loaded(&self) -> std::io::Result<()> {
        if *self.loaded.lock() {
            return Ok(());
        }
        let snapshot = match self.store.get(&self.snapshot_key).await {
            Ok(bytes) => serde_json::from_slice::<KeyedSnapshot>(&bytes)
                .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => KeyedSnapshot::default(),
            Err(e) => return Err(e),
        };
        let mut loaded = self.loaded.lock();
        if !*loaded {
            self.data.lock().durable = snapshot;
            *loaded = true;
        }
        Ok(())
    }

    pub async fn rows(&self, table: &TableId) -> std::io::Result<BTreeMap<PrimaryKey, Row>> {
        self.ensure_loaded().await?;
        Ok(self.data.lock().live_rows(table))
    }
}

impl KeyedTable for ObjectStoreKeyedTable {
    fn write_batch<'a>(&'a self, writes: &'a [KeyedWrite]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            self.ensure_loaded().await?;
            Ok(self.data.lock().stage(writes))
        })
    }

    fn commit(&self, watermark: Position) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_loaded().await?;
            let bytes = {
                let data = self.data.lock();
                serde_json::to_vec(&data.merged(watermark))
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?
            };
            self.store.put(&self.temp_key, &bytes).await?;
            self.store.rename(&self.temp_key, &self.snapshot_key).await?;
            self.data.lock().commit(watermark);
            Ok(())
        })
    }

    fn watermark(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move {
            self.ensure_loaded().await?;
            Ok(self.data.lock().durable.watermark)
        })
    }

    fn prune_tombstones(&self, up_to: Position) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.ensure_loaded().await?;
            let (pruned, bytes) = {
                let mut data = self.data.lock();
                let pruned = data.prune(up_to);
                if pruned == 0 {
                    return Ok(0);
                }
                let bytes = serde_json::to_vec(&data.durable)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
                (pruned, bytes)
            };
            self.store.put(&self.temp_key, &bytes).await?;
            self.store.rename(&self.temp_key, &self.snapshot_key).await?;
            Ok(pruned)
        })
    }
}

/// How columns missing from the declared table schema are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// Accept new columns and record them as part of the table schema.
    #[default]
    Evolve,
    /// Strip columns that are not declared.
    DropUnknown,
}

pub struct UpsertTableSink<T: KeyedTable> {
    id: SinkId,
    target: T,
    key_columns: BTreeMap<TableId, Vec<String>>,
    schema_policy: SchemaPolicy,
    columns: BTreeMap<TableId, BTreeSet<String>>,
    prune_tombstones: bool,
    accepted: Option<Position>,
    durable: Option<Position>,
    dirty: bool,
}

impl<T: KeyedTable> UpsertTableSink<T> {
    pub fn new(id: impl Into<SinkId>, target: T) -> Self {
        UpsertTableSink {
            id: id.into(),
            target,
            key_columns: BTreeMap::new(),
            schema_policy: SchemaPolicy::default(),
            columns: BTreeMap::new(),
            prune_tombstones: true,
            accepted: None,
            durable: None,
            dirty: false,
        }
    }

    /// Override the source-declared key for `table`.
    pub fn with_key_columns(mut self, table: TableId, columns: Vec<String>) -> Self {
        self.key_columns.insert(table, columns);
        self
    }

    pub fn with_schema_policy(mut self, policy: SchemaPolicy) -> Self {
        self.schema_policy = policy;
        self
    }

    /// Declare the column set of `table`.
    pub fn with_columns(mut self, table: TableId, columns: impl IntoIterator<Item = String>) -> Self {
        self.columns.insert(table, columns.into_iter().collect());
        self
    }

    pub fn with_tombstone_pruning(mut self, enabled: bool) -> Self {
        self.prune_tombstones = enabled;
        self
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Known columns of `table` after any evolution.
    pub fn columns(&self, table: &TableId) -> Option<&BTreeSet<String>> {
        self.columns.get(table)
    }

    fn reconcile(&mut self, table: &TableId, mut row: Row) -> Row {
        match self.schema_policy {
            SchemaPolicy::Evolve => {
                let known = self.columns.entry(table.clone()).or_default();
                for column in row.keys() {
                    if known.insert(column.clone()) {
                        info!(sink = %self.id, table = %table, column = %column, "Column added");
                    }
                }
                row
            }
            SchemaPolicy::DropUnknown => {
                if let Some(known) = self.columns.get(table) {
                    row.retain(|column, _| known.contains(column));
                }
                row
            }
        }
    }

    fn writes_for(&mut self, event: &ChangeEvent) -> Result<Vec<KeyedWrite>, SinkError> {
        let override_columns = self.key_columns.get(&event.table_id).cloned();
        let key = event
            .key_with(override_columns.as_deref())
            .ok_or_else(|| SinkError::MissingPrimaryKey {
                table: event.table_id.clone(),
                position: event.source_position,
            })?;

        let mut writes = Vec::with_capacity(2);
        let write = |key: PrimaryKey, row: Option<Row>| KeyedWrite {
            table: event.table_id.clone(),
            key,
            row,
            position: event.source_position,
            commit_timestamp: event.commit_timestamp,
        };

        match event.operation {
            Operation::Delete => writes.push(write(key, None)),
            Operation::Insert | Operation::Update => {
                // A key change moves the row: tombstone the old key first.
                if event.operation == Operation::Update {
                    let columns = override_columns.as_deref().unwrap_or(&event.primary_key);
                    if let Some(old_key) = event
                        .before_image
                        .as_ref()
                        .and_then(|before| PrimaryKey::from_row(before, columns))
                    {
                        if old_key != key {
                            writes.push(write(old_key, None));
                        }
                    }
                }
                let row = event.after_image.clone().unwrap_or_default();
                let row = self.reconcile(&event.table_id, row);
                writes.push(write(key, Some(row)));
            }
        }
        Ok(writes)
    }
}

impl<T: KeyedTable> SinkWriter for UpsertTableSink<T> {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::UpsertTable
    }

    fn recover(&mut self) -> SinkFuture<'_, Option<Position>> {
        Box::pin(async move {
            let watermark = self.target.watermark().await?;
            self.durable = watermark;
            self.accepted = watermark;
            Ok(watermark)
        })
    }

    fn apply<'a>(&'a mut self, batch: &'a [Arc<ChangeEvent>]) -> SinkFuture<'a, Option<Position>> {
        Box::pin(async move {
            let mut writes = Vec::with_capacity(batch.len());
            let mut last = None;
            for event in after_watermark(batch, self.accepted) {
                writes.extend(self.writes_for(event)?);
                last = Some(event.source_position);
            }
            if writes.is_empty() {
                return Ok(self.accepted);
            }
            let applied = self.target.write_batch(&writes).await?;
            debug!(sink = %self.id, writes = writes.len(), applied, "Upsert batch");
            self.accepted = last.max(self.accepted);
            self.dirty = true;
            Ok(self.accepted)
        })
    }

    fn flush(&mut self) -> SinkFuture<'_, Option<Position>> {
        Box::pin(async move {
            if let (true, Some(watermark)) = (self.dirty, self.accepted) {
                self.target.commit(watermark).await?;
                self.durable = Some(watermark);
                self.dirty = false;
            }
            Ok(self.durable)
        })
    }

    fn durable_position(&self) -> Option<Position> {
        self.durable
    }

    fn on_checkpoint(&mut self, confirmed: Position) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            if self.prune_tombstones {
                let pruned = self.target.prune_tombstones(confirmed).await?;
                if pruned > 0 {
                    debug!(sink = %self.id, pruned, up_to = %confirmed, "Pruned tombstones");
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use crate::store::InMemoryObjectStore;

    fn table() -> TableId {
        TableId::new("shop", "orders")
    }

    fn row(id: i64, status: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(id));
        row.insert("status".into(), Value::Text(status.into()));
        row
    }

    fn event(pos: u64, op: Operation, before: Option<Row>, after: Option<Row>) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent {
            source_position: Position(pos),
            table_id: table(),
            operation: op,
            before_image: before,
            after_image: after,
            commit_timestamp: pos * 10,
            primary_key: vec!["id".into()],
        })
    }

    fn key(id: i64) -> PrimaryKey {
        PrimaryKey::from_row(&row(id, ""), &["id".to_string()]).unwrap()
    }

    fn insert_update_delete() -> Vec<Arc<ChangeEvent>> {
        vec![
            event(10, Operation::Insert, None, Some(row(1, "new"))),
            event(11, Operation::Update, Some(row(1, "new")), Some(row(1, "paid"))),
            event(12, Operation::Delete, Some(row(1, "paid")), None),
        ]
    }

    #[tokio::test]
    async fn test_replay_after_delete_is_noop() {
        let target = InMemoryKeyedTable::new();
        let mut sink = UpsertTableSink::new("warehouse", target.clone());
        sink.recover().await.unwrap();

        let events = insert_update_delete();
        sink.apply(&events).await.unwrap();
        assert_eq!(sink.flush().await.unwrap(), Some(Position(12)));

        // A fresh writer replays the whole range: nothing may reappear.
        let mut replay = UpsertTableSink::new("warehouse", target.clone());
        target.inner.lock().durable.watermark = None;
        replay.recover().await.unwrap();
        replay.apply(&events).await.unwrap();
        replay.flush().await.unwrap();

        assert!(target.rows(&table()).is_empty());
        assert_eq!(target.get(&table(), &key(1)).unwrap().position, Position(12));
    }

    #[tokio::test]
    async fn test_crash_before_commit_loses_staged_only() {
        let target = InMemoryKeyedTable::new();
        let mut sink = UpsertTableSink::new("warehouse", target.clone());
        sink.recover().await.unwrap();

        let events = insert_update_delete();
        sink.apply(&events[..1]).await.unwrap();
        sink.flush().await.unwrap();
        sink.apply(&events[1..2]).await.unwrap();
        target.crash();

        let mut restarted = UpsertTableSink::new("warehouse", target.clone());
        assert_eq!(restarted.recover().await.unwrap(), Some(Position(10)));
        restarted.apply(&events).await.unwrap();
        restarted.flush().await.unwrap();
        assert!(target.rows(&table()).is_empty());
        assert_eq!(restarted.durable_position(), Some(Position(12)));
    }

    #[tokio::test]
    async fn test_missing_key_is_permanent() {
        let mut sink = UpsertTableSink::new("warehouse", InMemoryKeyedTable::new());
        let mut keyless = Row::new();
        keyless.insert("status".into(), Value::Text("x".into()));
        let events = vec![event(1, Operation::Insert, None, Some(keyless))];
        let err = sink.apply(&events).await.unwrap_err();
        assert!(matches!(err, SinkError::MissingPrimaryKey { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_key_change_moves_row() {
        let target = InMemoryKeyedTable::new();
        let mut sink = UpsertTableSink::new("warehouse", target.clone());
        let events = vec![
            event(1, Operation::Insert, None, Some(row(1, "new"))),
            event(2, Operation::Update, Some(row(1, "new")), Some(row(2, "new"))),
        ];
        sink.apply(&events).await.unwrap();
        sink.flush().await.unwrap();
        let rows = target.rows(&table());
        assert_eq!(rows.len(), 1);
        assert!(rows.contains_key(&key(2)));
    }

    #[tokio::test]
    async fn test_schema_policies() {
        let mut wide = row(1, "new");
        wide.insert("note".into(), Value::Text("gift".into()));
        let events = vec![event(1, Operation::Insert, None, Some(wide))];

        let target = InMemoryKeyedTable::new();
        let mut strict = UpsertTableSink::new("a", target.clone())
            .with_schema_policy(SchemaPolicy::DropUnknown)
            .with_columns(table(), ["id".to_string(), "status".to_string()]);
        strict.apply(&events).await.unwrap();
        strict.flush().await.unwrap();
        let stored = target.rows(&table()).remove(&key(1)).unwrap();
        assert!(!stored.contains_key("note"));

        let mut evolving = UpsertTableSink::new("b", InMemoryKeyedTable::new());
        evolving.apply(&events).await.unwrap();
        assert!(evolving.columns(&table()).unwrap().contains("note"));
    }

    #[tokio::test]
    async fn test_tombstones_pruned_at_checkpoint() {
        let target = InMemoryKeyedTable::new();
        let mut sink = UpsertTableSink::new("warehouse", target.clone());
        sink.apply(&insert_update_delete()).await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(target.tombstone_count(), 1);

        sink.on_checkpoint(Position(11)).await.unwrap();
        assert_eq!(target.tombstone_count(), 1);
        sink.on_checkpoint(Position(12)).await.unwrap();
        assert_eq!(target.tombstone_count(), 0);
    }

    #[tokio::test]
    async fn test_object_store_table_survives_reopen() {
        let store: SharedStore = Arc::new(InMemoryObjectStore::new());
        let mut sink = UpsertTableSink::new(
            "warehouse",
            ObjectStoreKeyedTable::new(store.clone(), "sinks/warehouse"),
        );
        sink.apply(&insert_update_delete()[..2]).await.unwrap();
        sink.flush().await.unwrap();

        let reopened = ObjectStoreKeyedTable::new(store, "sinks/warehouse");
        assert_eq!(reopened.watermark().await.unwrap(), Some(Position(11)));
        let rows = reopened.rows(&table()).await.unwrap();
        assert_eq!(rows[&key(1)]["status"], Value::Text("paid".into()));
    }
}
