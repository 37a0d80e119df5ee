//! Operation payload values.

use crate::path::FieldPath;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A structured record: field name to value, in key order.
pub type Record = BTreeMap<String, OpValue>;

/// The payload an operation carries.
///
/// Merge strategies pattern-match on these shapes. Equality is structural;
/// decimals compare by IEEE total order so `NaN == NaN` and `0.0 != -0.0`.
/// The total [`Ord`] ranks variants in declaration order first and is what
/// set-union uses to produce a canonical ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OpValue {
    /// Explicit absence.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Decimal(f64),
    /// UTF-8 text.
    Text(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Ordered collection.
    List(Vec<OpValue>),
    /// Nested record.
    Record(Record),
}

impl OpValue {
    fn rank(&self) -> u8 {
        match self {
            OpValue::Null => 0,
            OpValue::Bool(_) => 1,
            OpValue::Integer(_) => 2,
            OpValue::Decimal(_) => 3,
            OpValue::Text(_) => 4,
            OpValue::Timestamp(_) => 5,
            OpValue::List(_) => 6,
            OpValue::Record(_) => 7,
        }
    }

    /// Short name of the value shape, for messages.
    #[must_use]
    pub fn shape(&self) -> &'static str {
        match self {
            OpValue::Null => "null",
            OpValue::Bool(_) => "bool",
            OpValue::Integer(_) => "integer",
            OpValue::Decimal(_) => "decimal",
            OpValue::Text(_) => "text",
            OpValue::Timestamp(_) => "timestamp",
            OpValue::List(_) => "list",
            OpValue::Record(_) => "record",
        }
    }

    /// Creates an empty record.
    #[must_use]
    pub fn empty_record() -> Self {
        OpValue::Record(Record::new())
    }

    /// Creates a text value.
    pub fn text(s: impl Into<String>) -> Self {
        OpValue::Text(s.into())
    }

    /// Returns the text if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OpValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an integer value.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            OpValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the numeric value of integers and decimals.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            OpValue::Integer(v) => Some(*v as f64),
            OpValue::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the list items if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[OpValue]> {
        match self {
            OpValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the record if this is a record.
    #[must_use]
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            OpValue::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Looks up a nested value.
    #[must_use]
    pub fn get(&self, path: &FieldPath) -> Option<&OpValue> {
        match self {
            OpValue::Record(r) => lookup(r, path),
            _ => None,
        }
    }
}

/// Looks up `path` inside `record`, descending through nested records.
#[must_use]
pub fn lookup<'a>(record: &'a Record, path: &FieldPath) -> Option<&'a OpValue> {
    let mut segments = path.segments();
    let first = segments.next()?;
    let mut current = record.get(first)?;
    for segment in segments {
        current = current.as_record()?.get(segment)?;
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate records. A non-record
/// value sitting on the way is replaced by a record.
pub fn assign(record: &mut Record, path: &FieldPath, value: OpValue) {
    let segments: Vec<&str> = path.segments().collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = record;
    for segment in parents {
        let slot = current
            .entry((*segment).to_string())
            .or_insert_with(OpValue::empty_record);
        if !matches!(slot, OpValue::Record(_)) {
            *slot = OpValue::empty_record();
        }
        current = match slot {
            OpValue::Record(inner) => inner,
            _ => return,
        };
    }
    current.insert((*last).to_string(), value);
}

impl PartialEq for OpValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpValue {}

impl PartialOrd for OpValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (OpValue::Null, OpValue::Null) => Ordering::Equal,
            (OpValue::Bool(a), OpValue::Bool(b)) => a.cmp(b),
            (OpValue::Integer(a), OpValue::Integer(b)) => a.cmp(b),
            (OpValue::Decimal(a), OpValue::Decimal(b)) => a.total_cmp(b),
            (OpValue::Text(a), OpValue::Text(b)) => a.cmp(b),
            (OpValue::Timestamp(a), OpValue::Timestamp(b)) => a.cmp(b),
            (OpValue::List(a), OpValue::List(b)) => a.cmp(b),
            (OpValue::Record(a), OpValue::Record(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<bool> for OpValue {
    fn from(v: bool) -> Self {
        OpValue::Bool(v)
    }
}

impl From<i64> for OpValue {
    fn from(v: i64) -> Self {
        OpValue::Integer(v)
    }
}

impl From<f64> for OpValue {
    fn from(v: f64) -> Self {
        OpValue::Decimal(v)
    }
}

impl From<&str> for OpValue {
    fn from(v: &str) -> Self {
        OpValue::Text(v.to_string())
    }
}

impl From<String> for OpValue {
    fn from(v: String) -> Self {
        OpValue::Text(v)
    }
}

impl From<Vec<OpValue>> for OpValue {
    fn from(v: Vec<OpValue>) -> Self {
        OpValue::List(v)
    }
}

impl From<Record> for OpValue {
    fn from(v: Record) -> Self {
        OpValue::Record(v)
    }
}
