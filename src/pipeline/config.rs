//! Pipeline configuration.
//!
//! Loaded from TOML or JSON. Durations are written in milliseconds.
//!
//! ```toml
//! pipeline_id = "orders"
//!
//! [checkpoint]
//! interval = 5000
//!
//! [[sinks]]
//! id = "warehouse"
//! kind = "upsert_table"
//!
//! [[bindings]]
//! table = "shop.orders"
//! sinks = ["warehouse"]
//! ```

use crate::checkpoint::CheckpointConfig;
use crate::decode::DecodeFailurePolicy;
use crate::event::{StartPosition, TableId};
use crate::retry::RetryPolicy;
use crate::router::{SinkBindings, SinkId};
use crate::sink::{SchemaPolicy, SinkKind};
use crate::source::FileLogConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const ENV_CONFIG: &str = "CDC_CONFIG";
pub const ENV_DATA_DIR: &str = "CDC_DATA_DIR";
pub const ENV_LOG_FORMAT: &str = "CDC_LOG_FORMAT";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Events buffered per sink before the reader blocks.
    pub sink_queue_capacity: usize,
    /// Upper bound on events handed to one `apply`.
    pub batch_max_events: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            sink_queue_capacity: 1_024,
            batch_max_events: 256,
        }
    }
}

impl QueueConfig {
    pub fn test() -> Self {
        QueueConfig {
            sink_queue_capacity: 16,
            batch_max_events: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
    /// Key prefix for lease and position records.
    pub prefix: String,
    /// Lease holder name. Defaults to host, process id and a random suffix
    /// so two instances in one process never share a name.
    pub owner: Option<String>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            ttl: Duration::from_secs(30),
            prefix: "positions".to_string(),
            owner: None,
        }
    }
}

impl LeaseConfig {
    pub fn test() -> Self {
        LeaseConfig {
            ttl: Duration::from_millis(3_000),
            ..Default::default()
        }
    }

    /// Name recorded on the lease. Draws a fresh suffix on every call when
    /// no owner is configured, so call it once per started instance.
    pub fn owner_name(&self) -> String {
        self.owner.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("{}-{}-{:08x}", host, std::process::id(), rand::random::<u32>())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub id: SinkId,
    pub kind: SinkKind,
    /// Object store prefix for the destination. Defaults to `sinks/{id}`.
    pub prefix: Option<String>,
    /// Per-table key column overrides, keyed by `schema.table`.
    pub key_columns: BTreeMap<TableId, Vec<String>>,
    pub schema_policy: SchemaPolicy,
    /// Declared columns per table, used by `drop_unknown`.
    pub columns: BTreeMap<TableId, Vec<String>>,
    pub prune_tombstones: bool,
    pub max_batch_rows: usize,
    #[serde(with = "duration_millis")]
    pub max_batch_age: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            id: SinkId::from(""),
            kind: SinkKind::UpsertTable,
            prefix: None,
            key_columns: BTreeMap::new(),
            schema_policy: SchemaPolicy::default(),
            columns: BTreeMap::new(),
            prune_tombstones: true,
            max_batch_rows: 10_000,
            max_batch_age: Duration::from_secs(30),
        }
    }
}

impl SinkConfig {
    pub fn new(id: impl Into<SinkId>, kind: SinkKind) -> Self {
        SinkConfig {
            id: id.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn store_prefix(&self) -> String {
        self.prefix
            .clone()
            .unwrap_or_else(|| format!("sinks/{}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub table: TableId,
    pub sinks: Vec<SinkId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Read through the buffered topic instead of the source directly.
    pub enabled: bool,
    pub topic: String,
    pub partitions: u32,
    /// Records kept per partition before the oldest segments are dropped.
    pub retention_records: u64,
    /// Records per segment object.
    pub segment_records: usize,
    pub compression: bool,
    /// Partition this consumer reads.
    pub partition: u32,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            enabled: false,
            topic: "changes".to_string(),
            partitions: 1,
            retention_records: 1_000_000,
            segment_records: 1_000,
            compression: false,
            partition: 0,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl TransportConfig {
    pub fn test() -> Self {
        TransportConfig {
            enabled: true,
            retention_records: 10_000,
            segment_records: 8,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    /// Where a pipeline with no stored position starts.
    pub start: StartPosition,
    pub decode_failure: DecodeFailurePolicy,
    pub checkpoint: CheckpointConfig,
    pub source_retry: RetryPolicy,
    pub sink_retry: RetryPolicy,
    pub queue: QueueConfig,
    pub lease: LeaseConfig,
    pub source: FileLogConfig,
    pub sinks: Vec<SinkConfig>,
    pub bindings: Vec<BindingConfig>,
    pub transport: TransportConfig,
    /// Control loop period: checkpoint polls, stall checks, lease renewal.
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
    /// How long `stop` waits for sinks to drain and flush.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            pipeline_id: "cdc".to_string(),
            start: StartPosition::Earliest,
            decode_failure: DecodeFailurePolicy::Fail,
            checkpoint: CheckpointConfig::default(),
            source_retry: RetryPolicy::default(),
            sink_retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
            lease: LeaseConfig::default(),
            source: FileLogConfig::default(),
            sinks: Vec::new(),
            bindings: Vec::new(),
            transport: TransportConfig::default(),
            tick_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Fast settings for tests.
    pub fn test(pipeline_id: &str) -> Self {
        PipelineConfig {
            pipeline_id: pipeline_id.to_string(),
            checkpoint: CheckpointConfig::test(),
            source_retry: RetryPolicy::test(),
            sink_retry: RetryPolicy::test(),
            queue: QueueConfig::test(),
            lease: LeaseConfig::test(),
            tick_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn bind(mut self, table: TableId, sink: impl Into<SinkId>) -> Self {
        let sink = sink.into();
        match self.bindings.iter_mut().find(|b| b.table == table) {
            Some(binding) => binding.sinks.push(sink),
            None => self.bindings.push(BindingConfig {
                table,
                sinks: vec![sink],
            }),
        }
        self
    }

    /// Parse TOML, or JSON when the text starts with `{`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        if text.trim_start().starts_with('{') {
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `CDC_CONFIG` and resolve the source directory against
    /// `CDC_DATA_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let data_dir = data_dir_from_env();
        if config.source.dir.is_relative() {
            config.source.dir = data_dir.join(&config.source.dir);
        }
        Ok(config)
    }

    pub fn sink(&self, id: &SinkId) -> Option<&SinkConfig> {
        self.sinks.iter().find(|s| &s.id == id)
    }

    pub fn sink_bindings(&self) -> SinkBindings {
        let mut bindings = SinkBindings::new();
        for binding in &self.bindings {
            for sink in &binding.sinks {
                bindings.bind(binding.table.clone(), sink.clone());
            }
        }
        bindings
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_id.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline_id is empty".into()));
        }
        if self.queue.sink_queue_capacity == 0 || self.queue.batch_max_events == 0 {
            return Err(ConfigError::Invalid("queue sizes must be positive".into()));
        }
        if self.checkpoint.event_threshold == 0 {
            return Err(ConfigError::Invalid("checkpoint.event_threshold must be positive".into()));
        }
        if self.lease.ttl.is_zero() {
            return Err(ConfigError::Invalid("lease.ttl must be positive".into()));
        }
        if self.transport.enabled
            && (self.transport.partitions == 0 || self.transport.segment_records == 0)
        {
            return Err(ConfigError::Invalid("transport sizes must be positive".into()));
        }
        if self.transport.enabled && self.transport.partition >= self.transport.partitions {
            return Err(ConfigError::Invalid(format!(
                "transport.partition {} out of range for {} partitions",
                self.transport.partition, self.transport.partitions
            )));
        }

        let mut ids = BTreeSet::new();
        for sink in &self.sinks {
            if sink.id.as_str().trim().is_empty() {
                return Err(ConfigError::Invalid("sink id is empty".into()));
            }
            if !ids.insert(sink.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate sink id {}", sink.id)));
            }
            if sink.kind == SinkKind::OlapNative && sink.max_batch_rows == 0 {
                return Err(ConfigError::Invalid(format!(
                    "sink {}: max_batch_rows must be positive",
                    sink.id
                )));
            }
        }
        if ids.is_empty() {
            return Err(ConfigError::Invalid("no sinks configured".into()));
        }

        for binding in &self.bindings {
            for sink in &binding.sinks {
                if !ids.contains(sink) {
                    return Err(ConfigError::Invalid(format!(
                        "table {} bound to unknown sink {}",
                        binding.table, sink
                    )));
                }
            }
        }

        let bindings = self.sink_bindings();
        for id in &ids {
            if bindings.tables_for(id).is_empty() {
                warn!(sink = %id, "Sink is not bound to any table");
            }
        }
        Ok(())
    }
}

pub fn data_dir_from_env() -> PathBuf {
    std::env::var(ENV_DATA_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

/// Serde helper: `Duration` as whole milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableId {
        TableId::new("shop", "orders")
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            pipeline_id = "orders"
            start = "head"

            [checkpoint]
            interval = 2000
            event_threshold = 50

            [lease]
            ttl = 9000

            [[sinks]]
            id = "warehouse"
            kind = "upsert_table"
            schema_policy = "drop_unknown"

            [sinks.key_columns]
            "shop.orders" = ["order_id"]

            [[sinks]]
            id = "lake"
            kind = "olap_native"
            max_batch_rows = 500
            max_batch_age = 1500

            [[bindings]]
            table = "shop.orders"
            sinks = ["warehouse", "lake"]
        "#;
        let config = PipelineConfig::parse(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.start, StartPosition::Head);
        assert_eq!(config.checkpoint.interval, Duration::from_secs(2));
        assert_eq!(config.lease.ttl, Duration::from_secs(9));
        assert_eq!(config.sinks[0].schema_policy, SchemaPolicy::DropUnknown);
        assert_eq!(config.sinks[0].key_columns[&table()], vec!["order_id".to_string()]);
        assert_eq!(config.sinks[1].max_batch_age, Duration::from_millis(1500));
        assert_eq!(config.sink_bindings().sinks_for(&table()).len(), 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = PipelineConfig::test("p")
            .with_sink(SinkConfig::new("audit", SinkKind::AppendLog))
            .bind(table(), "audit");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(PipelineConfig::parse(&json).unwrap(), config);
    }

    #[test]
    fn test_default_owner_names_differ_per_instance() {
        let lease = LeaseConfig::default();
        assert_ne!(lease.owner_name(), lease.owner_name());

        let named = LeaseConfig {
            owner: Some("node-a".into()),
            ..LeaseConfig::default()
        };
        assert_eq!(named.owner_name(), "node-a");
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let base = PipelineConfig::test("p").with_sink(SinkConfig::new("a", SinkKind::AppendLog));

        let unknown = base.clone().bind(table(), "missing");
        assert!(matches!(unknown.validate(), Err(ConfigError::Invalid(_))));

        let mut empty_id = base.clone();
        empty_id.pipeline_id = " ".into();
        assert!(empty_id.validate().is_err());

        let mut zero_queue = base.clone();
        zero_queue.queue.sink_queue_capacity = 0;
        assert!(zero_queue.validate().is_err());

        let duplicate = base.clone().with_sink(SinkConfig::new("a", SinkKind::UpsertTable));
        assert!(duplicate.validate().is_err());

        let mut bad_partition = base.clone();
        bad_partition.transport = TransportConfig::test();
        bad_partition.transport.partition = 3;
        assert!(bad_partition.validate().is_err());

        // An unbound sink is only a warning.
        assert!(base.validate().is_ok());
    }
}
