use std::sync::Arc;

use arrow::datatypes::DataType;
use datafusion::scalar::ScalarValue;

use crate::common::{Event, Offset, Record};
use crate::runtime::operators::window::aggregates::{get_aggregate_registry, AccumulatorValue};
use crate::runtime::operators::window::plan::{
    AggregateStep, BinaryOp, ColumnPlan, DerivedStep, Expr, Reducer, Step, TimePolicy,
    WindowConfig,
};
use crate::runtime::operators::window::state::{
    ApplyOutcome, StateCell, TRACE_ID_FIELD, WINDOW_START_FIELD,
};

const START: i64 = 1_000;
const END: i64 = 2_000;

fn agg(column: &str, function: &str, source: &str) -> Step {
    let function = get_aggregate_registry()
        .resolve(function, &DataType::Int64)
        .expect("registered aggregate");
    Step::Aggregate(AggregateStep::new(column, source, function))
}

fn derived(column: &str, expr: Expr) -> Step {
    Step::Derived(DerivedStep::new(column, Arc::new(expr)))
}

/// count = count(*), total_len = sum(len), avg_len = total_len / count
fn length_config() -> WindowConfig {
    let plan = ColumnPlan::new()
        .with_column("count", vec![agg("count", "count", "*")])
        .and_then(|p| p.with_column("total_len", vec![agg("total_len", "sum", "len")]))
        .and_then(|p| {
            p.with_column(
                "avg_len",
                vec![derived(
                    "avg_len",
                    Expr::binary(BinaryOp::Div, Expr::column("total_len"), Expr::column("count")),
                )],
            )
        })
        .expect("plan");
    WindowConfig::new(plan)
}

fn event(partition: &str, offset: u64, len: i64) -> Event {
    Event::new(partition, Some(Offset::from(offset)), Record::new())
        .with_field("len", ScalarValue::Int64(Some(len)))
}

fn int(v: i64) -> ScalarValue {
    ScalarValue::Int64(Some(v))
}

fn cell_with(config: &WindowConfig, events: &[Event]) -> StateCell {
    let cell = StateCell::new(START, END, END, "g1");
    for e in events {
        assert_eq!(cell.apply(config, e).unwrap(), ApplyOutcome::Applied);
    }
    cell
}

fn assert_columns(cell: &StateCell, expected: &[(&str, ScalarValue)]) {
    for (column, value) in expected {
        assert_eq!(
            cell.derived_value(column).as_ref(),
            Some(value),
            "unexpected value for {column}"
        );
    }
}

#[test]
fn test_apply_counts_sums_and_derives() {
    let config = length_config();
    let cell = cell_with(
        &config,
        &[event("p0", 1, 10), event("p0", 2, 20), event("p0", 3, 30)],
    );

    assert_columns(
        &cell,
        &[("count", int(3)), ("total_len", int(60)), ("avg_len", int(20))],
    );
    assert_eq!(cell.max_offset("p0"), Some(Offset::from("3")));
    assert!(cell.last_update_time().is_some());
}

#[test]
fn test_stale_event_leaves_cell_unchanged() {
    let config = length_config();
    let cell = cell_with(
        &config,
        &[event("p0", 1, 10), event("p0", 2, 20), event("p0", 3, 30)],
    );
    let aggregates = cell.aggregate_snapshot();
    let derived = cell.derived_snapshot();

    assert_eq!(cell.apply(&config, &event("p0", 2, 500)).unwrap(), ApplyOutcome::Rejected);
    assert_eq!(cell.apply(&config, &event("p0", 3, 500)).unwrap(), ApplyOutcome::Rejected);

    assert_eq!(cell.aggregate_snapshot(), aggregates);
    assert_eq!(cell.derived_snapshot(), derived);
    assert_eq!(cell.max_offset("p0"), Some(Offset::from("3")));
}

#[test]
fn test_merge_across_partitions() {
    let config = length_config();
    let p0 = cell_with(
        &config,
        &[event("p0", 1, 10), event("p0", 2, 20), event("p0", 3, 30)],
    );
    let p1 = cell_with(&config, &[event("p1", 7, 4), event("p1", 8, 6)]);

    let merged = StateCell::merge(&config, &[&p0, &p1]).unwrap();

    assert_columns(
        &merged,
        &[("count", int(5)), ("total_len", int(70)), ("avg_len", int(14))],
    );
    assert_eq!(merged.group_key(), "g1");
    assert_eq!(merged.window_start(), START);
    assert_eq!(merged.max_offset("p0"), Some(Offset::from("3")));
    assert_eq!(merged.max_offset("p1"), Some(Offset::from("8")));

    // inputs keep their own state
    assert_eq!(p0.derived_value("count"), Some(int(3)));
    assert_eq!(p1.derived_value("count"), Some(int(2)));
}

#[test]
fn test_merge_of_single_cell_is_identity() {
    let config = length_config();
    let cell = cell_with(&config, &[event("p0", 1, 3), event("p0", 2, 9)]);

    let merged = StateCell::merge(&config, &[&cell]).unwrap();
    assert_eq!(merged.derived_snapshot(), cell.derived_snapshot());
    for (column, name) in [("count", "count"), ("total_len", "sum")] {
        let function = get_aggregate_registry().resolve(name, &DataType::Int64).unwrap();
        assert_eq!(
            function.finalize(&merged.accumulator(column).unwrap()).unwrap(),
            function.finalize(&cell.accumulator(column).unwrap()).unwrap()
        );
    }
}

#[test]
fn test_merge_is_associative() {
    let config = length_config();
    let a = cell_with(&config, &[event("p0", 1, 10), event("p0", 2, 11)]);
    let b = cell_with(&config, &[event("p1", 1, 100)]);
    let c = cell_with(&config, &[event("p2", 5, 1), event("p2", 6, 2), event("p2", 9, 3)]);

    let flat = StateCell::merge(&config, &[&a, &b, &c]).unwrap();
    let ab = StateCell::merge(&config, &[&a, &b]).unwrap();
    let nested = StateCell::merge(&config, &[&ab, &c]).unwrap();

    for column in ["count", "total_len", "avg_len"] {
        assert_eq!(flat.derived_value(column), nested.derived_value(column));
    }
    assert_columns(&flat, &[("count", int(6)), ("total_len", int(127))]);
}

#[test]
fn test_merge_backfills_missing_accumulators() {
    let config = length_config();
    let fed = cell_with(&config, &[event("p0", 1, 10)]);
    let idle = fed.clone_identity();
    assert!(idle.accumulator("count").is_none());

    let merged = StateCell::merge(&config, &[&fed, &idle]).unwrap();

    assert_columns(&merged, &[("count", int(1)), ("total_len", int(10))]);
    assert!(idle.accumulator("count").is_some());
    assert!(idle.accumulator("total_len").is_some());
}

#[test]
fn test_merge_keeps_baseline_without_aggregates() {
    let plan = ColumnPlan::new()
        .with_column(
            "double",
            vec![derived(
                "double",
                Expr::binary(BinaryOp::Mul, Expr::column("x"), Expr::literal(int(2))),
            )],
        )
        .unwrap();
    let config = WindowConfig::new(plan);
    let first = cell_with(
        &config,
        &[Event::new("p0", Some(Offset::from("1")), Record::new()).with_field("x", int(2))],
    );
    let second = cell_with(
        &config,
        &[Event::new("p1", Some(Offset::from("1")), Record::new()).with_field("x", int(5))],
    );

    let merged = StateCell::merge(&config, &[&first, &second]).unwrap();
    assert_eq!(merged.derived_value("double"), Some(int(4)));
}

#[test]
fn test_merge_keeps_event_field_columns_next_to_aggregates() {
    let plan = ColumnPlan::new()
        .with_column("cnt", vec![agg("cnt", "count", "*")])
        .and_then(|p| {
            p.with_column(
                "dbl",
                vec![derived(
                    "dbl",
                    Expr::binary(BinaryOp::Mul, Expr::column("len"), Expr::literal(int(2))),
                )],
            )
        })
        .unwrap();
    let config = WindowConfig::new(plan);
    let a = cell_with(&config, &[event("p0", 1, 5)]);
    let b = cell_with(&config, &[event("p1", 1, 7)]);
    assert_eq!(a.derived_value("dbl"), Some(int(10)));

    let merged = StateCell::merge(&config, &[&a, &b]).unwrap();
    assert_columns(&merged, &[("cnt", int(2)), ("dbl", int(10))]);

    let reversed = StateCell::merge(&config, &[&b, &a]).unwrap();
    assert_columns(&reversed, &[("cnt", int(2)), ("dbl", int(14))]);
}

#[test]
fn test_merge_recomputes_aggregate_chain() {
    let plan = ColumnPlan::new()
        .with_column(
            "bumped",
            vec![
                agg("bumped_sum", "sum", "len"),
                derived(
                    "bumped",
                    Expr::binary(BinaryOp::Add, Expr::column("bumped_sum"), Expr::literal(int(1))),
                ),
            ],
        )
        .unwrap();
    let config = WindowConfig::new(plan);
    let a = cell_with(&config, &[event("p0", 1, 10), event("p0", 2, 20)]);
    let b = cell_with(&config, &[event("p1", 1, 5)]);
    assert_eq!(a.derived_value("bumped"), Some(int(31)));

    let merged = StateCell::merge(&config, &[&a, &b]).unwrap();
    assert_eq!(merged.derived_value("bumped"), Some(int(36)));
    assert!(merged.derived_value("bumped_sum").is_none());
}

#[test]
fn test_merge_rejects_empty_input() {
    assert!(StateCell::merge(&length_config(), &[]).is_err());
}

#[test]
fn test_trace_ids_are_concatenated_in_order() {
    let config = length_config();
    let a = cell_with(&config, &[event("p0", 1, 1)]);
    let b = cell_with(&config, &[event("p1", 1, 1)]);
    let c = cell_with(&config, &[event("p2", 1, 1)]);
    let trace = |id: &str| {
        Record::from([(
            TRACE_ID_FIELD.to_string(),
            ScalarValue::Utf8(Some(id.to_string())),
        )])
    };
    a.put_derived_values(trace("t1"));
    c.put_derived_values(trace("t2,t1"));

    let merged = StateCell::merge(&config, &[&a, &b, &c]).unwrap();
    assert_eq!(
        merged.derived_value(TRACE_ID_FIELD),
        Some(ScalarValue::Utf8(Some("t1,t2,t1".to_string())))
    );
}

#[test]
fn test_projection_copies_present_fields_only() {
    let config = length_config()
        .with_projection("user", "user_id")
        .with_projection("start", WINDOW_START_FIELD);
    let cell = StateCell::new(START, END, END, "g1");

    let outcome = cell.apply(&config, &event("p0", 1, 10)).unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert!(cell.derived_value("user").is_none());
    assert_eq!(
        cell.derived_value("start"),
        Some(ScalarValue::TimestampMillisecond(Some(START), None))
    );

    let named = event("p0", 2, 10).with_field("user_id", ScalarValue::Utf8(Some("u7".into())));
    cell.apply(&config, &named).unwrap();
    assert_eq!(cell.derived_value("user"), Some(ScalarValue::Utf8(Some("u7".into()))));
}

#[test]
fn test_failed_apply_leaves_cell_untouched() {
    let plan = ColumnPlan::new()
        .with_column("count", vec![agg("count", "count", "*")])
        .and_then(|p| {
            p.with_column(
                "ratio",
                vec![derived(
                    "ratio",
                    Expr::binary(BinaryOp::Div, Expr::column("count"), Expr::literal(int(0))),
                )],
            )
        })
        .unwrap();
    let config = WindowConfig::new(plan);
    let cell = StateCell::new(START, END, END, "g1");

    let err = cell.apply(&config, &event("p0", 1, 10)).unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("ratio"), "{message}");
    assert!(message.contains("group=g1"), "{message}");

    assert!(cell.aggregate_snapshot().is_empty());
    assert!(cell.derived_snapshot().is_empty());
    assert!(cell.max_offset("p0").is_none());
    assert!(cell.last_update_time().is_none());
}

#[test]
fn test_missing_offset_uses_wall_clock() {
    let config = length_config();
    let cell = StateCell::new(START, END, END, "g1");

    let unordered = Event::new("p0", None, Record::new()).with_field("len", int(1));
    assert_eq!(cell.apply(&config, &unordered).unwrap(), ApplyOutcome::Applied);
    assert!(cell.max_offset("p0").is_some());

    // the synthetic mark is far ahead of any transport offset
    assert_eq!(cell.apply(&config, &event("p0", 5, 1)).unwrap(), ApplyOutcome::Rejected);
    assert_eq!(cell.derived_value("count"), Some(int(1)));
}

#[derive(Debug)]
struct CountingReducer;

impl Reducer for CountingReducer {
    fn reduce(&self, previous: Option<&Record>, event: &Record) -> anyhow::Result<Record> {
        let seen = match previous.and_then(|p| p.get("seen")) {
            Some(ScalarValue::Int64(Some(n))) => *n,
            _ => 0,
        };
        let mut out = Record::new();
        out.insert("seen".to_string(), int(seen + 1));
        if let Some(len) = event.get("len") {
            out.insert("last_len".to_string(), len.clone());
        }
        Ok(out)
    }
}

#[test]
fn test_reducer_fast_path_replaces_derived_values() {
    let config = length_config().with_reducer(Arc::new(CountingReducer));
    let cell = cell_with(&config, &[event("p0", 1, 10), event("p0", 2, 20)]);

    assert_columns(&cell, &[("seen", int(2)), ("last_len", int(20))]);
    assert!(cell.derived_value("count").is_none());
    assert!(cell.aggregate_snapshot().is_empty());
}

#[test]
fn test_event_time_policy_sets_last_update_time() {
    let config = length_config().with_time_policy(TimePolicy::EventTime {
        field: "ts".to_string(),
    });
    let cell = StateCell::new(START, END, END, "g1");
    let e = event("p0", 1, 10).with_field("ts", ScalarValue::TimestampMillisecond(Some(1_500), None));
    cell.apply(&config, &e).unwrap();
    assert_eq!(cell.last_update_time(), Some(1_500));
}

#[test]
fn test_apply_partial_state_absorbs_other_cell() {
    let config = length_config();
    let cell = cell_with(
        &config,
        &[event("p0", 1, 10), event("p0", 2, 20), event("p0", 3, 30)],
    );
    let partial = cell_with(&config, &[event("p1", 1, 4), event("p1", 2, 6)]);

    cell.apply_partial_state(&config, &partial).unwrap();

    assert_columns(
        &cell,
        &[("count", int(5)), ("total_len", int(70)), ("avg_len", int(14))],
    );
    assert_eq!(partial.derived_value("count"), Some(int(2)));
}

#[test]
fn test_clone_does_not_share_accumulators() {
    let config = length_config();
    let cell = cell_with(&config, &[event("p0", 1, 10)]);
    let copy = cell.clone();

    cell.apply(&config, &event("p0", 2, 20)).unwrap();

    assert_eq!(copy.derived_value("count"), Some(int(1)));
    assert_eq!(cell.derived_value("count"), Some(int(2)));
    assert_ne!(copy.accumulator("total_len"), cell.accumulator("total_len"));
    assert_eq!(copy.max_offset("p0"), Some(Offset::from("1")));
}

#[test]
fn test_clone_identity_copies_identity_only() {
    let config = length_config();
    let mut cell = cell_with(&config, &[event("p0", 1, 10)]);
    cell.meta_mut().update_version = 7;
    cell.meta_mut().window_instance_id = Some("w-1".to_string());

    let fresh = cell.clone_identity();
    assert_eq!(fresh.meta(), cell.meta());
    assert_eq!(fresh.group_key(), "g1");
    assert_eq!(fresh.fire_time(), END);
    assert!(fresh.derived_snapshot().is_empty());
    assert!(fresh.aggregate_snapshot().is_empty());
    assert!(fresh.offsets_snapshot().is_empty());
}

#[test]
fn test_codec_roundtrip_after_apply_and_merge() {
    let registry = get_aggregate_registry();
    let avg = registry.resolve("avg", &DataType::Int64).unwrap();
    let mut config = length_config();
    config
        .plan
        .push_column(
            "mean_len",
            vec![Step::Aggregate(AggregateStep::new("mean_len", "len", avg.clone()))],
        )
        .unwrap();
    let config = config.with_projection("label", "label");

    let a = cell_with(
        &config,
        &[event("p0", 1, 3), event("p0", 2, 4).with_field("label", ScalarValue::Utf8(Some("x".into())))],
    );
    let b = cell_with(&config, &[event("p1", 11, 8)]);
    let merged = StateCell::merge(&config, &[&a, &b]).unwrap();

    for cell in [&a, &merged] {
        let encoded = cell.encode().unwrap();
        let restored = StateCell::decode(START, END, END, "g1", &encoded).unwrap();

        assert_eq!(restored.offsets_snapshot(), cell.offsets_snapshot());
        assert_eq!(restored.derived_snapshot(), cell.derived_snapshot());
        assert_eq!(restored.aggregate_snapshot(), cell.aggregate_snapshot());
        assert_eq!(
            avg.finalize(&restored.accumulator("mean_len").unwrap()).unwrap(),
            avg.finalize(&cell.accumulator("mean_len").unwrap()).unwrap()
        );
    }
    assert_eq!(merged.derived_value("mean_len"), Some(ScalarValue::Float64(Some(5.0))));
}

#[test]
fn test_restored_cell_keeps_rejecting_stale_events() {
    let config = length_config();
    let cell = cell_with(&config, &[event("p0", 1, 10), event("p0", 2, 20)]);
    let restored = StateCell::decode(START, END, END, "g1", &cell.encode().unwrap()).unwrap();

    assert_eq!(restored.apply(&config, &event("p0", 2, 1)).unwrap(), ApplyOutcome::Rejected);
    assert_eq!(restored.apply(&config, &event("p0", 3, 30)).unwrap(), ApplyOutcome::Applied);
    assert_columns(&restored, &[("count", int(3)), ("total_len", int(60))]);
}

#[test]
fn test_codec_roundtrip_with_unregistered_types() {
    let decimal = DataType::Decimal128(10, 2);
    let max = get_aggregate_registry().resolve("max", &decimal).unwrap();
    let plan = ColumnPlan::new()
        .with_column(
            "max_price",
            vec![Step::Aggregate(AggregateStep::new("max_price", "price", max))],
        )
        .unwrap();
    let config = WindowConfig::new(plan).with_projection("event_ts", "ts");
    let priced = |offset: u64, cents: i128| {
        Event::new("p0", Some(Offset::from(offset)), Record::new())
            .with_field("price", ScalarValue::Decimal128(Some(cents), 10, 2))
            .with_field("ts", ScalarValue::TimestampMillisecond(Some(5), Some("UTC".into())))
    };
    let cell = cell_with(&config, &[priced(1, 1_250), priced(2, 990)]);

    let restored = StateCell::decode(START, END, END, "g1", &cell.encode().unwrap()).unwrap();
    assert_eq!(restored.derived_snapshot(), cell.derived_snapshot());
    assert_eq!(restored.aggregate_snapshot(), cell.aggregate_snapshot());
    assert_eq!(
        restored.derived_value("event_ts"),
        Some(ScalarValue::TimestampMillisecond(Some(5), Some("UTC".into())))
    );

    restored.apply(&config, &priced(3, 4_000)).unwrap();
    assert_eq!(
        restored.derived_value("max_price"),
        Some(ScalarValue::Decimal128(Some(4_000), 10, 2))
    );
}

#[test]
fn test_removed_accumulator_restarts_empty() {
    let config = length_config();
    let cell = cell_with(&config, &[event("p0", 1, 10), event("p0", 2, 20)]);

    let removed = cell.remove_accumulator("total_len").unwrap();
    assert_eq!(removed, AccumulatorValue::Primitive(int(30)));
    assert!(cell.accumulator("total_len").is_none());

    cell.apply(&config, &event("p0", 3, 5)).unwrap();
    assert_columns(&cell, &[("count", int(3)), ("total_len", int(5))]);
}
