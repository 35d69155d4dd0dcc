use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::common::{now_millis, Offset, Record, Timestamp};
use crate::runtime::operators::window::aggregates::AccumulatorValue;
use crate::runtime::operators::window::state::ordering::OrderingGuard;

/// Group key used when the window has no group-by.
pub const DEFAULT_GROUP_KEY: &str = "0";

pub const WINDOW_START_FIELD: &str = "window_start";
pub const WINDOW_END_FIELD: &str = "window_end";

/// Reserved derived column collecting trace ids of contributing events.
pub const TRACE_ID_FIELD: &str = "__trace_id";

const UNSET_TIME: i64 = i64::MIN;

/// Bookkeeping owned by the persistence layer. Carried along, never read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMeta {
    pub id: Option<i64>,
    pub gmt_create: Timestamp,
    pub gmt_modified: Timestamp,
    pub update_version: u64,
    pub msg_key: Option<String>,
    pub window_instance_id: Option<String>,
    pub partition: Option<String>,
    pub partition_num: Option<i64>,
}

impl Default for CellMeta {
    fn default() -> Self {
        let now = now_millis();
        Self {
            id: None,
            gmt_create: now,
            gmt_modified: now,
            update_version: 0,
            msg_key: None,
            window_instance_id: None,
            partition: None,
            partition_num: None,
        }
    }
}

/// Outcome of applying one event to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Dropped by the ordering guard; the cell is unchanged.
    Rejected,
}

/// Aggregation state of one window instance, one group and the source
/// partitions that fed it.
pub struct StateCell {
    pub(crate) window_start: Timestamp,
    pub(crate) window_end: Timestamp,
    pub(crate) fire_time: Timestamp,
    pub(crate) group_key: String,
    pub(crate) meta: CellMeta,
    pub(crate) ordering: OrderingGuard,
    pub(crate) aggregate_state: DashMap<String, AccumulatorValue>,
    pub(crate) derived_values: DashMap<String, ScalarValue>,
    pub(crate) last_update_time: AtomicI64,
}

impl StateCell {
    pub fn new(
        window_start: Timestamp,
        window_end: Timestamp,
        fire_time: Timestamp,
        group_key: impl Into<String>,
    ) -> Self {
        Self {
            window_start,
            window_end,
            fire_time,
            group_key: group_key.into(),
            meta: CellMeta::default(),
            ordering: OrderingGuard::new(),
            aggregate_state: DashMap::new(),
            derived_values: DashMap::new(),
            last_update_time: AtomicI64::new(UNSET_TIME),
        }
    }

    /// Cell for a window without group-by.
    pub fn ungrouped(window_start: Timestamp, window_end: Timestamp, fire_time: Timestamp) -> Self {
        Self::new(window_start, window_end, fire_time, DEFAULT_GROUP_KEY)
    }

    /// Empty cell with the same window, group and metadata as `self`.
    pub fn clone_identity(&self) -> Self {
        let mut cell = Self::new(
            self.window_start,
            self.window_end,
            self.fire_time,
            self.group_key.clone(),
        );
        cell.meta = self.meta.clone();
        cell
    }

    pub fn identity(&self) -> String {
        format!(
            "window [{}, {}) group={}",
            self.window_start, self.window_end, self.group_key
        )
    }

    pub fn window_start(&self) -> Timestamp {
        self.window_start
    }

    pub fn window_end(&self) -> Timestamp {
        self.window_end
    }

    pub fn fire_time(&self) -> Timestamp {
        self.fire_time
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn meta(&self) -> &CellMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut CellMeta {
        &mut self.meta
    }

    pub fn last_update_time(&self) -> Option<Timestamp> {
        match self.last_update_time.load(Ordering::Acquire) {
            UNSET_TIME => None,
            ts => Some(ts),
        }
    }

    pub fn set_last_update_time(&self, ts: Timestamp) {
        self.last_update_time.store(ts, Ordering::Release);
    }

    pub fn ordering(&self) -> &OrderingGuard {
        &self.ordering
    }

    pub fn max_offset(&self, partition_id: &str) -> Option<Offset> {
        self.ordering.get(partition_id)
    }

    pub fn offsets_snapshot(&self) -> BTreeMap<String, Offset> {
        self.ordering.snapshot()
    }

    pub fn accumulator(&self, column: &str) -> Option<AccumulatorValue> {
        self.aggregate_state.get(column).map(|entry| entry.value().clone())
    }

    pub fn put_accumulator(&self, column: impl Into<String>, acc: AccumulatorValue) {
        self.aggregate_state.insert(column.into(), acc);
    }

    pub fn remove_accumulator(&self, column: &str) -> Option<AccumulatorValue> {
        self.aggregate_state.remove(column).map(|(_, acc)| acc)
    }

    pub fn aggregate_snapshot(&self) -> BTreeMap<String, AccumulatorValue> {
        self.aggregate_state
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn derived_value(&self, column: &str) -> Option<ScalarValue> {
        self.derived_values.get(column).map(|entry| entry.value().clone())
    }

    /// Merges a ready-made set of values into the derived columns.
    pub fn put_derived_values(&self, values: Record) {
        for (column, value) in values {
            self.derived_values.insert(column, value);
        }
    }

    pub fn derived_snapshot(&self) -> Record {
        self.derived_values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn replace_derived_values(&self, values: Record) {
        self.derived_values.clear();
        self.put_derived_values(values);
    }

    pub(crate) fn replace_aggregate_state(&self, accs: BTreeMap<String, AccumulatorValue>) {
        self.aggregate_state.clear();
        for (column, acc) in accs {
            self.aggregate_state.insert(column, acc);
        }
    }
}

/// Deep copy: accumulators are copied, never shared with the source cell.
impl Clone for StateCell {
    fn clone(&self) -> Self {
        let cell = self.clone_identity();
        cell.ordering.replace(self.ordering.snapshot());
        cell.replace_aggregate_state(self.aggregate_snapshot());
        cell.replace_derived_values(self.derived_snapshot());
        cell.last_update_time
            .store(self.last_update_time.load(Ordering::Acquire), Ordering::Release);
        cell
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("window_start", &self.window_start)
            .field("window_end", &self.window_end)
            .field("fire_time", &self.fire_time)
            .field("group_key", &self.group_key)
            .field("meta", &self.meta)
            .field("max_offset", &self.ordering.snapshot())
            .field("aggregate_state", &self.aggregate_snapshot())
            .field("derived_values", &self.derived_snapshot())
            .field("last_update_time", &self.last_update_time())
            .finish()
    }
}
