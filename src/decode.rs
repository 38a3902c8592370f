//! EventDecoder: raw log records to typed change events.
//!
//! Records carry a JSON change envelope:
//!
//! ```text
//! {"schema": "public", "table": "orders", "op": "u",
//!  "before": {...}, "after": {...}, "ts_ms": 1700000000000,
//!  "primary_key": ["id"]}
//! ```
//!
//! `op` is one of `c`/`r` (insert, snapshot read), `u`, `d`, or the long
//! names. Records carrying a `statement` field come from a statement-based
//! log and cannot be replayed row-by-row; they are always rejected.

use crate::event::{ChangeEvent, Operation, Position, RawChangeRecord, Row, TableId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// What to do with a record that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Stop the pipeline.
    #[default]
    Fail,
    /// Log, count and move past the record.
    SkipAndLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Malformed { position: Position, reason: String },
    UnknownOperation { position: Position, op: String },
    InvalidImages { position: Position, reason: String },
    /// Not a row-level record. Never skippable.
    StatementBased { position: Position },
}

impl DecodeError {
    pub fn position(&self) -> Position {
        match self {
            DecodeError::Malformed { position, .. }
            | DecodeError::UnknownOperation { position, .. }
            | DecodeError::InvalidImages { position, .. }
            | DecodeError::StatementBased { position } => *position,
        }
    }

    pub fn is_skippable(&self) -> bool {
        !matches!(self, DecodeError::StatementBased { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed { position, reason } => {
                write!(f, "malformed record at {}: {}", position, reason)
            }
            DecodeError::UnknownOperation { position, op } => {
                write!(f, "unknown operation {:?} at {}", op, position)
            }
            DecodeError::InvalidImages { position, reason } => {
                write!(f, "invalid row images at {}: {}", position, reason)
            }
            DecodeError::StatementBased { position } => write!(
                f,
                "statement-based record at {}; row-level change capture is required",
                position
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schema: String,
    table: String,
    op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    before: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    after: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ts_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    primary_key: Vec<String>,
}

fn parse_op(op: &str) -> Option<Operation> {
    match op {
        "c" | "r" | "insert" | "create" | "read" => Some(Operation::Insert),
        "u" | "update" => Some(Operation::Update),
        "d" | "delete" => Some(Operation::Delete),
        _ => None,
    }
}

fn to_row(map: JsonMap) -> Row {
    map.into_iter()
        .map(|(k, v)| (k, Value::from_json(v)))
        .collect()
}

fn to_map(row: &Row) -> JsonMap {
    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub decoded: u64,
    pub skipped: u64,
}

pub struct EventDecoder {
    policy: DecodeFailurePolicy,
    stats: DecoderStats,
}

impl EventDecoder {
    pub fn new(policy: DecodeFailurePolicy) -> Self {
        EventDecoder {
            policy,
            stats: DecoderStats::default(),
        }
    }

    pub fn policy(&self) -> DecodeFailurePolicy {
        self.policy
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Decode one record. Pure; does not consult the failure policy.
    pub fn decode(&self, raw: &RawChangeRecord) -> Result<ChangeEvent, DecodeError> {
        let position = raw.position;
        let value: serde_json::Value =
            serde_json::from_slice(&raw.payload).map_err(|e| DecodeError::Malformed {
                position,
                reason: e.to_string(),
            })?;
        if value.get("statement").is_some() {
            return Err(DecodeError::StatementBased { position });
        }
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
                position,
                reason: e.to_string(),
            })?;
        let operation = parse_op(&envelope.op).ok_or_else(|| DecodeError::UnknownOperation {
            position,
            op: envelope.op.clone(),
        })?;

        let event = ChangeEvent {
            source_position: position,
            table_id: TableId::new(envelope.schema, envelope.table),
            operation,
            before_image: envelope.before.map(to_row),
            after_image: envelope.after.map(to_row),
            commit_timestamp: envelope.ts_ms.unwrap_or(raw.commit_timestamp),
            primary_key: envelope.primary_key,
        };
        event
            .validate()
            .map_err(|reason| DecodeError::InvalidImages {
                position,
                reason: reason.to_string(),
            })?;
        Ok(event)
    }

    /// Decode honouring the failure policy. `Ok(None)` means the record was
    /// skipped.
    pub fn decode_with_policy(
        &mut self,
        raw: &RawChangeRecord,
    ) -> Result<Option<ChangeEvent>, DecodeError> {
        match self.decode(raw) {
            Ok(event) => {
                self.stats.decoded += 1;
                Ok(Some(event))
            }
            Err(e) if self.policy == DecodeFailurePolicy::SkipAndLog && e.is_skippable() => {
                self.stats.skipped += 1;
                warn!(position = %raw.position, error = %e, skipped = self.stats.skipped, "Skipping undecodable record");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Envelope payload for an event.
    pub fn encode_payload(event: &ChangeEvent) -> Vec<u8> {
        let envelope = Envelope {
            schema: event.table_id.schema.clone(),
            table: event.table_id.table.clone(),
            op: event.operation.code().to_string(),
            before: event.before_image.as_ref().map(to_map),
            after: event.after_image.as_ref().map(to_map),
            ts_ms: Some(event.commit_timestamp),
            primary_key: event.primary_key.clone(),
        };
        // Serializing a map of JSON values cannot fail.
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    /// Raw record for an event, at the event's own position.
    pub fn encode(event: &ChangeEvent) -> RawChangeRecord {
        RawChangeRecord::new(
            event.source_position,
            event.commit_timestamp,
            Self::encode_payload(event),
        )
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(DecodeFailurePolicy::Fail)
    }
}
