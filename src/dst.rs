//! Deterministic simulation of whole pipelines.
//!
//! A seeded workload appends inserts, updates and deletes to an in-memory
//! change log while a pipeline replicates them into three fault-injecting
//! destinations. Each round either stops the pipeline cleanly or crashes
//! it; the next round restarts it under a new owner. A last fault-free round
//! drains the log, after which every destination is compared against a
//! shadow model built from the workload alone.
//!
//! ```text
//! for seed in 0..100 {
//!     let result = PipelineDstHarness::new(PipelineDstConfig::moderate(seed)).run().await;
//!     assert!(result.is_success(), "{}", result.summary());
//! }
//! ```
//!
//! The workload and every fault decision draw from the seed. Task
//! interleaving is left to the tokio runtime.

use crate::clock::{SharedClock, SimulatedClock};
use crate::decode::EventDecoder;
use crate::event::{ChangeEvent, Operation, Position, PrimaryKey, Row, TableId, Value};
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use crate::pipeline::{
    PipelineBuilder, PipelineConfig, PipelineError, PipelineHandle, PipelinePhase, SinkConfig,
};
use crate::position::{PositionStore, PositionStoreError};
use crate::router::SinkId;
use crate::sink::{
    AppendLogSink, BoxedSink, FaultyTarget, InMemoryAppendLog, InMemoryBulkIngest,
    InMemoryKeyedTable, OlapBatchLimits, OlapNativeSink, SinkKind, TargetFaults, UpsertTableSink,
};
use crate::source::InMemoryChangeLog;
use crate::store::{
    InMemoryObjectStore, SharedStore, SimulatedObjectStore, SimulatedStoreConfig,
    SimulatedStoreStats,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const TABLE_SINK: &str = "table";
pub const LOG_SINK: &str = "log";
pub const OLAP_SINK: &str = "olap";

const SCHEMA: &str = "public";
const PIPELINE_ID: &str = "dst";
const START_ATTEMPTS: usize = 5;

/// Simulated tables and the sinks each is bound to. `audit` is unbound.
const TABLES: &[(&str, &[&str])] = &[
    ("accounts", &[TABLE_SINK, LOG_SINK, OLAP_SINK]),
    ("orders", &[TABLE_SINK, LOG_SINK]),
    ("audit", &[]),
];

#[derive(Debug, Clone)]
pub struct PipelineDstConfig {
    pub seed: u64,
    /// Faulty rounds before the final drain.
    pub rounds: usize,
    pub events_per_round: usize,
    pub keys_per_table: u64,
    /// Chance that a round ends in a crash rather than a clean stop.
    pub crash_probability: f64,
    pub store_config: SimulatedStoreConfig,
    pub target_faults: TargetFaults,
    pub source_disconnect_prob: f64,
    /// How long a round waits for the checkpoint to reach the log head.
    pub round_timeout: Duration,
}

impl Default for PipelineDstConfig {
    fn default() -> Self {
        PipelineDstConfig {
            seed: 0,
            rounds: 4,
            events_per_round: 60,
            keys_per_table: 12,
            crash_probability: 0.3,
            store_config: SimulatedStoreConfig::default(),
            target_faults: TargetFaults::moderate(),
            source_disconnect_prob: 0.01,
            round_timeout: Duration::from_secs(5),
        }
    }
}

impl PipelineDstConfig {
    pub fn new(seed: u64) -> Self {
        PipelineDstConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults and no crashes.
    pub fn calm(seed: u64) -> Self {
        PipelineDstConfig {
            seed,
            crash_probability: 0.0,
            store_config: SimulatedStoreConfig::no_faults(),
            target_faults: TargetFaults::none(),
            source_disconnect_prob: 0.0,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    pub fn chaos(seed: u64) -> Self {
        PipelineDstConfig {
            seed,
            crash_probability: 0.6,
            store_config: SimulatedStoreConfig::high_chaos(),
            target_faults: TargetFaults {
                write_fail_prob: 0.08,
                write_timeout_prob: 0.04,
                flush_fail_prob: 0.08,
                fail_after: None,
            },
            source_disconnect_prob: 0.05,
            ..Default::default()
        }
    }
}

/// One generated row change, before it has a log position.
#[derive(Debug, Clone)]
struct GeneratedChange {
    table: usize,
    operation: Operation,
    before: Option<Row>,
    after: Option<Row>,
}

/// Seeded generator of row changes over a small key space, so updates and
/// deletes hit rows that exist.
struct Workload {
    rng: SimulatedRng,
    keys: u64,
    live: BTreeMap<(usize, i64), Row>,
    version: i64,
}

impl Workload {
    fn new(rng: SimulatedRng, keys: u64) -> Self {
        Workload {
            rng,
            keys: keys.max(1),
            live: BTreeMap::new(),
            version: 0,
        }
    }

    fn row(&mut self, key: i64) -> Row {
        self.version += 1;
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(key));
        row.insert("balance".into(), Value::Int(self.rng.gen_range(0, 100_000) as i64));
        row.insert("version".into(), Value::Int(self.version));
        row
    }

    fn next_change(&mut self) -> GeneratedChange {
        let table = self.rng.gen_range(0, TABLES.len() as u64) as usize;
        let key = self.rng.gen_range(0, self.keys) as i64;
        let before = self.live.get(&(table, key)).cloned();
        let (operation, after) = match &before {
            None => (Operation::Insert, Some(self.row(key))),
            Some(_) if self.rng.gen_bool(0.25) => (Operation::Delete, None),
            Some(_) => (Operation::Update, Some(self.row(key))),
        };
        match &after {
            Some(row) => self.live.insert((table, key), row.clone()),
            None => self.live.remove(&(table, key)),
        };
        GeneratedChange {
            table,
            operation,
            before,
            after,
        }
    }
}

/// Expected destination contents, maintained from the workload alone.
#[derive(Debug, Default)]
pub struct ShadowModel {
    pub rows: BTreeMap<TableId, BTreeMap<PrimaryKey, Row>>,
    pub appended: Vec<Position>,
    pub loaded: BTreeSet<Position>,
}

impl ShadowModel {
    fn apply(&mut self, position: Position, table: &TableId, sinks: &[&str], change: &GeneratedChange) {
        if sinks.contains(&TABLE_SINK) {
            let image = change.after.as_ref().or(change.before.as_ref());
            if let Some(key) = image.and_then(|row| PrimaryKey::from_row(row, &key_columns())) {
                let rows = self.rows.entry(table.clone()).or_default();
                match &change.after {
                    Some(row) => {
                        rows.insert(key, row.clone());
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
            }
        }
        if sinks.contains(&LOG_SINK) {
            self.appended.push(position);
        }
        if sinks.contains(&OLAP_SINK) {
            self.loaded.insert(position);
        }
    }
}

fn key_columns() -> Vec<String> {
    vec!["id".to_string()]
}

fn table_id(index: usize) -> TableId {
    TableId::new(SCHEMA, TABLES[index].0)
}

#[derive(Debug, Clone)]
pub struct PipelineDstResult {
    pub seed: u64,
    pub rounds: u64,
    pub events: u64,
    pub crashes: u64,
    pub clean_stops: u64,
    /// Runs that ended FAILED or whose stop returned an error.
    pub failed_runs: u64,
    pub start_failures: u64,
    pub injected_target_faults: u64,
    pub final_position: Option<Position>,
    pub store_stats: SimulatedStoreStats,
    pub invariant_violations: Vec<String>,
}

impl PipelineDstResult {
    pub fn new(seed: u64) -> Self {
        PipelineDstResult {
            seed,
            rounds: 0,
            events: 0,
            crashes: 0,
            clean_stops: 0,
            failed_runs: 0,
            start_failures: 0,
            injected_target_faults: 0,
            final_position: None,
            store_stats: SimulatedStoreStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} rounds, {} events, {} crashes, {} clean stops, {} failed runs, {} start failures, {} target faults, {} violations{}",
            self.seed,
            self.rounds,
            self.events,
            self.crashes,
            self.clean_stops,
            self.failed_runs,
            self.start_failures,
            self.injected_target_faults,
            self.invariant_violations.len(),
            if self.invariant_violations.is_empty() {
                String::new()
            } else {
                format!(": {:?}", self.invariant_violations)
            }
        )
    }
}

type DstStore = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;
type DstTable = Arc<FaultyTarget<InMemoryKeyedTable>>;
type DstLog = Arc<FaultyTarget<InMemoryAppendLog>>;
type DstIngest = Arc<FaultyTarget<InMemoryBulkIngest>>;

pub struct PipelineDstHarness {
    config: PipelineDstConfig,
    rng: SimulatedRng,
    workload: Workload,
    shadow: ShadowModel,
    log: InMemoryChangeLog,
    /// Durable contents; the faulty store wraps it.
    inner_store: InMemoryObjectStore,
    store: Arc<DstStore>,
    clock: SimulatedClock,
    table: InMemoryKeyedTable,
    append: InMemoryAppendLog,
    olap: InMemoryBulkIngest,
    /// Fault wrappers of the current incarnation, for fault counts.
    targets: Option<(DstTable, DstLog, DstIngest)>,
    incarnation: u64,
    confirmed: Option<Position>,
    sink_positions: BTreeMap<SinkId, Position>,
    result: PipelineDstResult,
}

impl PipelineDstHarness {
    pub fn new(config: PipelineDstConfig) -> Self {
        let mut rng = SimulatedRng::new(config.seed);
        let log = InMemoryChangeLog::new();
        let log = if config.source_disconnect_prob > 0.0 {
            log.with_faults(rng.fork(), config.source_disconnect_prob)
        } else {
            log
        };
        let inner_store = InMemoryObjectStore::new();
        let store = Arc::new(SimulatedObjectStore::new(
            inner_store.clone(),
            rng.fork(),
            config.store_config.clone(),
        ));
        let workload = Workload::new(rng.fork(), config.keys_per_table);
        let result = PipelineDstResult::new(config.seed);

        PipelineDstHarness {
            config,
            rng,
            workload,
            shadow: ShadowModel::default(),
            log,
            inner_store,
            store,
            clock: SimulatedClock::new(1_000_000),
            table: InMemoryKeyedTable::new(),
            append: InMemoryAppendLog::new(),
            olap: InMemoryBulkIngest::new(),
            targets: None,
            incarnation: 0,
            confirmed: None,
            sink_positions: BTreeMap::new(),
            result,
        }
    }

    pub fn shadow(&self) -> &ShadowModel {
        &self.shadow
    }

    /// Run every round plus the final drain and check the end state.
    pub async fn run(mut self) -> PipelineDstResult {
        let _ticker = self.spawn_clock_ticker();
        for _ in 0..self.config.rounds {
            self.run_round(false).await;
        }
        self.log.heal();
        self.run_round(true).await;
        self.check_end_state().await;
        self.result.store_stats = self.store.stats();
        self.result
    }

    /// Advance simulated time with real time so interval-driven checkpoints
    /// and batch ages fire.
    fn spawn_clock_ticker(&self) -> DropGuard {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => clock.advance_ms(1),
                }
            }
        });
        cancel.drop_guard()
    }

    fn pipeline_config(&self, owner: &str) -> PipelineConfig {
        let mut config = PipelineConfig::test(PIPELINE_ID)
            .with_sink(SinkConfig::new(TABLE_SINK, SinkKind::UpsertTable))
            .with_sink(SinkConfig::new(LOG_SINK, SinkKind::AppendLog))
            .with_sink(SinkConfig {
                max_batch_rows: 16,
                max_batch_age: Duration::from_millis(20),
                ..SinkConfig::new(OLAP_SINK, SinkKind::OlapNative)
            });
        for (index, (_, sinks)) in TABLES.iter().enumerate() {
            for sink in sinks.iter() {
                config = config.bind(table_id(index), *sink);
            }
        }
        config.lease.owner = Some(owner.to_string());
        config
    }

    fn writers(&mut self, faults: &TargetFaults) -> Vec<BoxedSink> {
        let table: DstTable = Arc::new(FaultyTarget::new(self.table.clone(), self.rng.fork(), faults.clone()));
        let append: DstLog = Arc::new(FaultyTarget::new(self.append.clone(), self.rng.fork(), faults.clone()));
        let olap: DstIngest = Arc::new(FaultyTarget::new(self.olap.clone(), self.rng.fork(), faults.clone()));
        let limits = OlapBatchLimits {
            max_batch_rows: 16,
            max_batch_age: Duration::from_millis(20),
        };
        let clock: SharedClock = Arc::new(self.clock.clone());
        let writers: Vec<BoxedSink> = vec![
            Box::new(UpsertTableSink::new(TABLE_SINK, table.clone())),
            Box::new(AppendLogSink::new(LOG_SINK, append.clone())),
            Box::new(OlapNativeSink::new(OLAP_SINK, olap.clone(), limits, clock)),
        ];
        self.targets = Some((table, append, olap));
        writers
    }

    fn count_target_faults(&mut self) {
        if let Some((table, append, olap)) = self.targets.take() {
            self.result.injected_target_faults += table.injected() + append.injected() + olap.injected();
        }
    }

    fn append_events(&mut self) {
        for _ in 0..self.config.events_per_round {
            let change = self.workload.next_change();
            let table = table_id(change.table);
            let event = ChangeEvent {
                source_position: Position::ZERO,
                table_id: table.clone(),
                operation: change.operation,
                before_image: change.before.clone(),
                after_image: change.after.clone(),
                commit_timestamp: self.clock.current_ms(),
                primary_key: key_columns(),
            };
            let position = self
                .log
                .append(EventDecoder::encode_payload(&event), event.commit_timestamp);
            self.shadow.apply(position, &table, TABLES[change.table].1, &change);
            self.result.events += 1;
        }
    }

    fn lease_ttl(&self) -> Duration {
        PipelineConfig::test(PIPELINE_ID).lease.ttl
    }

    /// Let any lease left behind by a dead owner expire.
    fn expire_leases(&self) {
        self.clock.advance(self.lease_ttl() + Duration::from_millis(1));
    }

    async fn start_pipeline(&mut self, final_round: bool) -> Option<PipelineHandle> {
        self.incarnation += 1;
        let owner = format!("dst-node-{}", self.incarnation);
        let mut last_error = None;
        for _ in 0..START_ATTEMPTS {
            let state_store: SharedStore = if final_round {
                Arc::new(self.inner_store.clone())
            } else {
                self.store.clone()
            };
            let faults = if final_round {
                TargetFaults::none()
            } else {
                self.config.target_faults.clone()
            };
            let mut builder = PipelineBuilder::new(self.pipeline_config(&owner))
                .source(Arc::new(self.log.clone()))
                .state_store(state_store)
                .clock(Arc::new(self.clock.clone()));
            for writer in self.writers(&faults) {
                builder = builder.writer(writer);
            }
            match builder.start().await {
                Ok(handle) => return Some(handle),
                Err(PipelineError::Position(PositionStoreError::LeaseConflict { .. })) => {
                    self.count_target_faults();
                    self.expire_leases();
                    last_error = Some("lease conflict".to_string());
                }
                Err(e @ PipelineError::BindingsChanged { .. }) | Err(e @ PipelineError::Config(_)) => {
                    self.count_target_faults();
                    self.result
                        .invariant_violations
                        .push(format!("pipeline rejected its own configuration: {}", e));
                    return None;
                }
                Err(e) => {
                    self.count_target_faults();
                    last_error = Some(e.to_string());
                }
            }
            self.result.start_failures += 1;
        }
        if final_round {
            self.result.invariant_violations.push(format!(
                "fault-free start failed: {}",
                last_error.unwrap_or_default()
            ));
        }
        None
    }

    async fn run_round(&mut self, final_round: bool) {
        self.result.rounds += 1;
        self.append_events();
        let head = self.log.head();

        let Some(handle) = self.start_pipeline(final_round).await else {
            self.expire_leases();
            return;
        };

        let crash = !final_round && self.rng.gen_bool(self.config.crash_probability);
        if crash {
            let run_for = self.rng.gen_range(1, 60);
            tokio::time::sleep(Duration::from_millis(run_for)).await;
            handle.abort().await;
            // Aborted sink tasks stop at their next await point.
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.table.crash();
            self.append.crash();
            self.expire_leases();
            self.result.crashes += 1;
        } else {
            let reached = handle
                .wait_for(self.config.round_timeout, |status| {
                    head.map_or(true, |h| status.confirmed_through(h)) || status.phase.is_terminal()
                })
                .await;
            let status = match reached {
                Ok(status) | Err(status) => status,
            };
            if final_round && !head.map_or(true, |h| status.confirmed_through(h)) {
                self.result.invariant_violations.push(format!(
                    "final round confirmed {:?} of head {:?} (phase {}, reason {:?})",
                    status.last_confirmed_position, head, status.phase, status.reason
                ));
            }
            let failed = status.phase == PipelinePhase::Failed;
            match handle.stop().await {
                Ok(report) if !failed => {
                    self.result.clean_stops += 1;
                    if final_round {
                        self.result.final_position = report.last_confirmed_position;
                    }
                }
                Ok(_) | Err(_) => {
                    self.result.failed_runs += 1;
                    self.expire_leases();
                }
            }
        }
        self.count_target_faults();
        self.check_checkpoint().await;
        self.check_destinations();
    }

    /// The stored checkpoint never moves backwards, and nothing it covers
    /// is missing from a destination.
    async fn check_checkpoint(&mut self) {
        let positions = PositionStore::new(
            Arc::new(self.inner_store.clone()),
            PipelineConfig::test(PIPELINE_ID).lease.prefix,
            Arc::new(self.clock.clone()),
            self.lease_ttl(),
        );
        let state = match positions.load(PIPELINE_ID).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                self.result
                    .invariant_violations
                    .push(format!("stored state unreadable: {}", e));
                return;
            }
        };

        if state.last_confirmed_position < self.confirmed {
            self.result.invariant_violations.push(format!(
                "checkpoint regressed from {:?} to {:?}",
                self.confirmed, state.last_confirmed_position
            ));
        }
        for (sink, previous) in &self.sink_positions {
            if state.sink_positions.get(sink).map_or(true, |p| p < previous) {
                self.result.invariant_violations.push(format!(
                    "sink {} position regressed from {} to {:?}",
                    sink,
                    previous,
                    state.sink_positions.get(sink)
                ));
            }
        }
        self.confirmed = state.last_confirmed_position;
        self.sink_positions = state.sink_positions.clone();

        let covered = |sink: &str| {
            let sink_position = state.sink_positions.get(&SinkId::from(sink)).copied();
            sink_position.max(state.last_confirmed_position)
        };

        if let Some(through) = covered(LOG_SINK) {
            let durable: BTreeSet<Position> = self.append.records().iter().map(|r| r.position).collect();
            if let Some(missing) = self
                .shadow
                .appended
                .iter()
                .find(|p| **p <= through && !durable.contains(p))
            {
                self.result.invariant_violations.push(format!(
                    "append log lacks {} although checkpointed through {}",
                    missing, through
                ));
            }
        }
        if let Some(through) = covered(OLAP_SINK) {
            let loaded: BTreeSet<Position> = self.olap.rows().iter().map(|r| r.position).collect();
            if let Some(missing) = self
                .shadow
                .loaded
                .iter()
                .find(|p| **p <= through && !loaded.contains(p))
            {
                self.result.invariant_violations.push(format!(
                    "bulk destination lacks {} although checkpointed through {}",
                    missing, through
                ));
            }
        }
    }

    /// No destination ever holds an event twice or out of order.
    fn check_destinations(&mut self) {
        let appended: Vec<Position> = self.append.records().iter().map(|r| r.position).collect();
        if let Some(pair) = appended.windows(2).find(|w| w[0] >= w[1]) {
            self.result.invariant_violations.push(format!(
                "append log out of order or duplicated at {} then {}",
                pair[0], pair[1]
            ));
        }

        let rows = self.olap.rows();
        let distinct: BTreeSet<Position> = rows.iter().map(|r| r.position).collect();
        if distinct.len() != rows.len() {
            self.result.invariant_violations.push(format!(
                "bulk destination holds {} rows for {} positions",
                rows.len(),
                distinct.len()
            ));
        }
    }

    async fn check_end_state(&mut self) {
        let head = self.log.head();
        if self.confirmed != head {
            self.result.invariant_violations.push(format!(
                "final checkpoint {:?} differs from log head {:?}",
                self.confirmed, head
            ));
        }

        for (index, (_, sinks)) in TABLES.iter().enumerate() {
            if !sinks.contains(&TABLE_SINK) {
                continue;
            }
            let table = table_id(index);
            let expected = self.shadow.rows.get(&table).cloned().unwrap_or_default();
            let actual = self.table.rows(&table);
            if actual != expected {
                self.result.invariant_violations.push(format!(
                    "table {} holds {} rows, expected {}",
                    table,
                    actual.len(),
                    expected.len()
                ));
            }
        }

        let appended: Vec<Position> = self.append.records().iter().map(|r| r.position).collect();
        if appended != self.shadow.appended {
            self.result.invariant_violations.push(format!(
                "append log holds {} records, expected {}",
                appended.len(),
                self.shadow.appended.len()
            ));
        }

        let loaded: BTreeSet<Position> = self.olap.rows().iter().map(|r| r.position).collect();
        if loaded != self.shadow.loaded {
            self.result.invariant_violations.push(format!(
                "bulk destination holds {} positions, expected {}",
                loaded.len(),
                self.shadow.loaded.len()
            ));
        }
    }
}

/// Run `count` seeds starting at `base_seed`.
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> PipelineDstConfig,
) -> Vec<PipelineDstResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let seed = base_seed + i as u64;
        results.push(PipelineDstHarness::new(config_fn(seed)).run().await);
    }
    results
}

pub fn summarize_batch(results: &[PipelineDstResult]) -> String {
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();
    let events: u64 = results.iter().map(|r| r.events).sum();
    let crashes: u64 = results.iter().map(|r| r.crashes).sum();
    let faults: u64 = results.iter().map(|r| r.injected_target_faults).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} events, {} crashes, {} target faults",
        passed,
        results.len(),
        events,
        crashes,
        faults
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
