use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::common::Offset;

/// Per source-partition high-water mark.
///
/// Stored offsets only move forward. Written by the single owner of the
/// cell, readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct OrderingGuard {
    max_offset: DashMap<String, Offset>,
}

impl OrderingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event at `offset` on `partition_id` would be accepted.
    pub fn admits(&self, partition_id: &str, offset: &Offset) -> bool {
        match self.max_offset.get(partition_id) {
            Some(current) => offset > current.value(),
            None => true,
        }
    }

    /// Records `offset` as the new mark if it is ahead of the current one.
    pub fn advance(&self, partition_id: &str, offset: Offset) {
        self.max_offset
            .entry(partition_id.to_string())
            .and_modify(|current| {
                if offset > *current {
                    *current = offset.clone();
                }
            })
            .or_insert(offset);
    }

    pub fn accept(&self, partition_id: &str, offset: &Offset) -> bool {
        if !self.admits(partition_id, offset) {
            if let Some(current) = self.get(partition_id) {
                tracing::warn!(
                    partition = %partition_id,
                    max_offset = %current,
                    offset = %offset,
                    "out of order event dropped"
                );
            }
            return false;
        }
        self.advance(partition_id, offset.clone());
        true
    }

    pub fn get(&self, partition_id: &str) -> Option<Offset> {
        self.max_offset.get(partition_id).map(|entry| entry.value().clone())
    }

    /// Keeps, per partition, the larger of both marks.
    pub fn merge_from(&self, other: &OrderingGuard) {
        for entry in other.max_offset.iter() {
            self.advance(entry.key(), entry.value().clone());
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Offset> {
        self.max_offset
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn replace(&self, offsets: BTreeMap<String, Offset>) {
        self.max_offset.clear();
        for (partition, offset) in offsets {
            self.max_offset.insert(partition, offset);
        }
    }
}
