//! Change events and source positions.
//!
//! A [`RawChangeRecord`] is what the source log hands out: an opaque payload
//! stamped with a [`Position`]. The decoder turns it into a [`ChangeEvent`],
//! the unit that is routed to sinks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Totally ordered offset in the source change log.
///
/// Positions are assigned by the source, start at 1 and strictly increase.
/// They may have gaps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn new(value: u64) -> Self {
        Position(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Position {
        Position(self.0.saturating_add(1))
    }

    /// Events between `self` (exclusive) and `head` (inclusive).
    pub fn distance_to(&self, head: Position) -> u64 {
        head.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest record still retained by the source.
    #[default]
    Earliest,
    /// Only records appended after the stream opens.
    Head,
    /// Resume strictly after a confirmed position.
    At(Position),
}

impl StartPosition {
    pub fn resume_after(position: Option<Position>) -> Self {
        match position {
            Some(p) => StartPosition::At(p),
            None => StartPosition::Earliest,
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Earliest => write!(f, "earliest"),
            StartPosition::Head => write!(f, "head"),
            StartPosition::At(p) => write!(f, "at({})", p),
        }
    }
}

/// Qualified source table, written `schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableId {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIdParseError(pub String);

impl fmt::Display for TableIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table id must be `schema.table`, got {:?}", self.0)
    }
}

impl std::error::Error for TableIdParseError {}

impl FromStr for TableId {
    type Err = TableIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(TableId::new(schema, table))
            }
            _ => Err(TableIdParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for TableId {
    type Error = TableIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TableId> for String {
    fn from(id: TableId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Single-letter envelope code.
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Insert => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`, kept exact.
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Nested document, kept as compact JSON text.
    Json(String),
}

const BYTES_TAG: &str = "$bytes";

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn from_json(value: serde_json::Value) -> Value {
        use serde_json::Value as J;
        match value {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Value::Int(i),
                (None, Some(u)) => Value::UInt(u),
                (None, None) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => Value::Text(s),
            J::Object(map) if map.len() == 1 && map.contains_key(BYTES_TAG) => {
                match map.get(BYTES_TAG).and_then(|v| v.as_str()).and_then(decode_hex) {
                    Some(bytes) => Value::Bytes(bytes),
                    None => Value::Json(J::Object(map).to_string()),
                }
            }
            other => Value::Json(other.to_string()),
        }
    }

    /// Inverse of [`Value::from_json`]. Non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::UInt(u) => J::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            Value::Text(s) => J::String(s.clone()),
            Value::Bytes(b) => {
                let mut map = serde_json::Map::new();
                map.insert(BYTES_TAG.to_string(), J::String(encode_hex(b)));
                J::Object(map)
            }
            Value::Json(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| J::String(text.clone()))
            }
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Column name to value.
pub type Row = BTreeMap<String, Value>;

/// Canonical encoding of a row's primary-key values, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(pub String);

impl PrimaryKey {
    /// Build from `columns` of `row`. `None` if any column is missing or null.
    pub fn from_row(row: &Row, columns: &[String]) -> Option<PrimaryKey> {
        if columns.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            match row.get(column) {
                Some(value) if !value.is_null() => parts.push(value.to_json()),
                _ => return None,
            }
        }
        Some(PrimaryKey(serde_json::Value::Array(parts).to_string()))
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque record as read from the source log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChangeRecord {
    pub position: Position,
    /// Commit time in ms, if the log records one.
    pub commit_timestamp: u64,
    pub payload: Bytes,
}

impl RawChangeRecord {
    pub fn new(position: Position, commit_timestamp: u64, payload: impl Into<Bytes>) -> Self {
        RawChangeRecord {
            position,
            commit_timestamp,
            payload: payload.into(),
        }
    }
}

/// A decoded row-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_position: Position,
    pub table_id: TableId,
    pub operation: Operation,
    pub before_image: Option<Row>,
    pub after_image: Option<Row>,
    pub commit_timestamp: u64,
    /// Key columns as declared by the source, possibly empty.
    pub primary_key: Vec<String>,
}

impl ChangeEvent {
    /// Checks that images match the operation: inserts carry only an after
    /// image, deletes only a before image, updates both.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self.operation {
            Operation::Insert if self.after_image.is_none() => Err("insert without after image"),
            Operation::Insert if self.before_image.is_some() => Err("insert with before image"),
            Operation::Update if self.after_image.is_none() => Err("update without after image"),
            Operation::Update if self.before_image.is_none() => Err("update without before image"),
            Operation::Delete if self.before_image.is_none() => Err("delete without before image"),
            Operation::Delete if self.after_image.is_some() => Err("delete with after image"),
            _ => Ok(()),
        }
    }

    /// Image that identifies the row: after for writes, before for deletes.
    pub fn key_image(&self) -> Option<&Row> {
        match self.operation {
            Operation::Delete => self.before_image.as_ref(),
            Operation::Insert | Operation::Update => {
                self.after_image.as_ref().or(self.before_image.as_ref())
            }
        }
    }

    /// Primary key using `columns`, falling back to the source-declared key.
    pub fn key_with(&self, columns: Option<&[String]>) -> Option<PrimaryKey> {
        let columns = columns.unwrap_or(&self.primary_key);
        PrimaryKey::from_row(self.key_image()?, columns)
    }

    pub fn key(&self) -> Option<PrimaryKey> {
        self.key_with(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_table_id_parse() {
        let id: TableId = "public.orders".parse().unwrap();
        assert_eq!(id, TableId::new("public", "orders"));
        assert_eq!(id.to_string(), "public.orders");
        assert!("orders".parse::<TableId>().is_err());
        assert!(".orders".parse::<TableId>().is_err());
    }

    #[test]
    fn test_table_id_serde_as_string() {
        let id = TableId::new("app", "users");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"app.users\"");
        let back: TableId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_start_position_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            start: StartPosition,
        }
        let w: Wrapper = toml::from_str("start = \"earliest\"").unwrap();
        assert_eq!(w.start, StartPosition::Earliest);
        let w: Wrapper = toml::from_str("start = { at = 42 }").unwrap();
        assert_eq!(w.start, StartPosition::At(Position(42)));
    }

    #[test]
    fn test_value_json_conversion() {
        assert_eq!(Value::from_json(serde_json::json!(5)), Value::Int(5));
        assert_eq!(Value::from_json(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(
            Value::from_json(serde_json::json!({"a": 1})),
            Value::Json("{\"a\":1}".to_string())
        );
        let bytes = Value::Bytes(vec![0, 1, 254, 255]);
        assert_eq!(Value::from_json(bytes.to_json()), bytes);
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_unsigned_keys_above_i64_stay_distinct() {
        let high: serde_json::Value = serde_json::from_str("18446744073709551614").unwrap();
        let max: serde_json::Value = serde_json::from_str("18446744073709551615").unwrap();
        assert_eq!(Value::from_json(high.clone()), Value::UInt(u64::MAX - 1));
        assert_eq!(Value::from_json(max), Value::UInt(u64::MAX));
        assert_eq!(Value::UInt(u64::MAX - 1).to_json(), high);

        let cols = vec!["id".to_string()];
        let a = PrimaryKey::from_row(&row(&[("id", Value::UInt(u64::MAX - 1))]), &cols).unwrap();
        let b = PrimaryKey::from_row(&row(&[("id", Value::UInt(u64::MAX))]), &cols).unwrap();
        assert_ne!(a, b);
        assert_eq!(b, PrimaryKey("[18446744073709551615]".to_string()));
    }

    #[test]
    fn test_primary_key_requires_all_columns() {
        let r = row(&[("id", Value::Int(7)), ("region", Value::Text("eu".into()))]);
        let cols = vec!["id".to_string(), "region".to_string()];
        assert_eq!(
            PrimaryKey::from_row(&r, &cols),
            Some(PrimaryKey("[7,\"eu\"]".to_string()))
        );

        let missing = vec!["id".to_string(), "tenant".to_string()];
        assert_eq!(PrimaryKey::from_row(&r, &missing), None);

        let nulled = row(&[("id", Value::Null)]);
        assert_eq!(PrimaryKey::from_row(&nulled, &["id".to_string()]), None);
    }

    #[test]
    fn test_delete_keys_from_before_image() {
        let event = ChangeEvent {
            source_position: Position(3),
            table_id: TableId::new("s", "t"),
            operation: Operation::Delete,
            before_image: Some(row(&[("id", Value::Int(1))])),
            after_image: None,
            commit_timestamp: 0,
            primary_key: vec!["id".to_string()],
        };
        assert!(event.validate().is_ok());
        assert_eq!(event.key(), Some(PrimaryKey("[1]".to_string())));
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let event = ChangeEvent {
            source_position: Position(1),
            table_id: TableId::new("s", "t"),
            operation: Operation::Insert,
            before_image: None,
            after_image: None,
            commit_timestamp: 0,
            primary_key: vec![],
        };
        assert!(event.validate().is_err());

        let r = row(&[("id", Value::Int(1))]);
        let update = ChangeEvent {
            operation: Operation::Update,
            before_image: None,
            after_image: Some(r.clone()),
            ..event
        };
        assert_eq!(update.validate(), Err("update without before image"));
        let update = ChangeEvent {
            before_image: Some(r),
            ..update
        };
        assert!(update.validate().is_ok());
    }
}
