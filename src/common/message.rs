use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};

use super::now_millis;

/// Field map of a single event or computed row.
pub type Record = HashMap<String, ScalarValue>;

/// Position of a message inside its source partition.
///
/// Offsets are kept as the transport hands them over. Comparison walks the
/// `.`-separated segments; digit-only segments compare numerically, anything
/// else compares lexicographically, and a strict prefix sorts first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    pub fn new(offset: impl Into<String>) -> Self {
        Self(offset.into())
    }

    /// Synthetic offset used when the transport did not provide one.
    pub fn wall_clock() -> Self {
        Self(now_millis().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn compare_segment(left: &str, right: &str) -> Ordering {
    if is_numeric(left) && is_numeric(right) {
        let l = left.trim_start_matches('0');
        let r = right.trim_start_matches('0');
        l.len().cmp(&r.len()).then_with(|| l.cmp(r))
    } else {
        left.cmp(right)
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.0.trim().split('.');
        let mut right = other.0.trim().split('.');
        loop {
            match (left.next(), right.next()) {
                (Some(l), Some(r)) => match compare_segment(l, r) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => return Ordering::Equal,
            }
        }
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Offset {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Offset {}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Offset {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Offset {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// A raw event as delivered by the transport: the source partition it was
/// read from, its position in that partition and its fields.
#[derive(Debug, Clone)]
pub struct Event {
    pub partition_id: String,
    pub offset: Option<Offset>,
    pub fields: Record,
}

impl Event {
    pub fn new(partition_id: impl Into<String>, offset: Option<Offset>, fields: Record) -> Self {
        Self {
            partition_id: partition_id.into(),
            offset,
            fields,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: ScalarValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&ScalarValue> {
        self.fields.get(name)
    }
}
