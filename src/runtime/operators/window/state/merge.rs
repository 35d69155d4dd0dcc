use anyhow::{anyhow, Context, Result};
use datafusion::scalar::ScalarValue;
use itertools::Itertools;

use crate::common::Record;
use crate::runtime::operators::window::aggregates::AccumulatorValue;
use crate::runtime::operators::window::plan::{AggregateStep, Step, WindowConfig};
use crate::runtime::operators::window::state::cell::{StateCell, TRACE_ID_FIELD};
use crate::runtime::utils::PrimitiveType;

impl StateCell {
    /// Combines cells of one window and group that were fed by different
    /// source partitions.
    ///
    /// Accumulators are merged directly, derived columns are re-evaluated
    /// only once an aggregate has been merged. The inputs are left as they
    /// are, except that a missing accumulator is back-filled with an empty
    /// one.
    pub fn merge(config: &WindowConfig, cells: &[&StateCell]) -> Result<StateCell> {
        let first = *cells
            .first()
            .ok_or_else(|| anyhow!("cannot merge an empty list of window cells"))?;

        let result = first.clone_identity();
        result.replace_derived_values(first.derived_snapshot());
        for cell in cells {
            result.ordering.merge_from(&cell.ordering);
        }
        if let Some(ts) = cells.iter().filter_map(|cell| cell.last_update_time()).max() {
            result.set_last_update_time(ts);
        }

        let mut needs_recompute = false;
        for (computed_column, steps) in config.plan.iter() {
            let mut scratch = Record::new();
            for step in steps {
                match step {
                    Step::Aggregate(agg) => {
                        let accs = cells
                            .iter()
                            .map(|cell| cell.accumulator_or_backfill(agg))
                            .collect::<Result<Vec<_>>>()?;
                        let merged = agg.function.merge_many(&accs).with_context(|| {
                            format!(
                                "{}: merging '{}' failed on column '{}'",
                                first.identity(),
                                agg.function.name(),
                                agg.column
                            )
                        })?;
                        let value = agg.function.finalize(&merged).with_context(|| {
                            format!("{}: finalizing column '{}' failed", first.identity(), agg.column)
                        })?;
                        result.put_accumulator(agg.column.clone(), merged);
                        scratch.insert(agg.column.clone(), value);
                        needs_recompute = true;
                    }
                    Step::Derived(derived) => {
                        let mut missing = Vec::new();
                        for column in derived.expression.dependent_columns() {
                            if scratch.contains_key(&column) {
                                continue;
                            }
                            let known = result
                                .derived_value(&column)
                                .or_else(|| first.derived_value(&column));
                            match known {
                                Some(value) => {
                                    scratch.insert(column, value);
                                }
                                None => missing.push(column),
                            }
                        }
                        if !missing.is_empty() {
                            // event fields are not kept by the cell
                            tracing::debug!(
                                cell = %first.identity(),
                                column = %derived.column,
                                missing = ?missing,
                                "inputs unavailable at merge, keeping baseline value"
                            );
                            if let Some(value) = first.derived_value(&derived.column) {
                                scratch.insert(derived.column.clone(), value);
                            }
                        } else if needs_recompute {
                            let value = derived.expression.evaluate(&scratch).with_context(|| {
                                format!(
                                    "{}: expression failed on column '{}'",
                                    first.identity(),
                                    derived.column
                                )
                            })?;
                            scratch.insert(derived.column.clone(), value);
                        }
                    }
                }
            }

            if let Some(value) = scratch.remove(computed_column) {
                result.derived_values.insert(computed_column.clone(), value);
            } else if !needs_recompute {
                if let Some(value) = first.derived_value(computed_column) {
                    result.derived_values.insert(computed_column.clone(), value);
                }
            }
        }

        let mut traces = cells
            .iter()
            .filter_map(|cell| cell.derived_value(TRACE_ID_FIELD))
            .filter_map(|value| PrimitiveType::to_text(&value))
            .peekable();
        if traces.peek().is_some() {
            let joined = traces.join(",");
            result
                .derived_values
                .insert(TRACE_ID_FIELD.to_string(), ScalarValue::Utf8(Some(joined)));
        }

        tracing::debug!(
            cell = %result.identity(),
            inputs = cells.len(),
            recomputed = needs_recompute,
            "merged window cells"
        );
        Ok(result)
    }

    fn accumulator_or_backfill(&self, agg: &AggregateStep) -> Result<AccumulatorValue> {
        if let Some(acc) = self.accumulator(&agg.column) {
            return Ok(acc);
        }
        let empty = agg.function.create_empty().with_context(|| {
            format!(
                "{}: creating empty '{}' for column '{}' failed",
                self.identity(),
                agg.function.name(),
                agg.column
            )
        })?;
        tracing::debug!(cell = %self.identity(), column = %agg.column, "back-filled empty accumulator");
        self.put_accumulator(agg.column.clone(), empty.clone());
        Ok(empty)
    }
}
