use std::collections::HashMap;

use anyhow::{Context, Result};
use datafusion::scalar::ScalarValue;

use crate::common::{Event, Offset, Record};
use crate::runtime::operators::window::aggregates::AccumulatorValue;
use crate::runtime::operators::window::plan::{AggregateStep, DerivedStep, Step, WindowConfig};
use crate::runtime::operators::window::state::cell::{
    ApplyOutcome, StateCell, WINDOW_END_FIELD, WINDOW_START_FIELD,
};

/// Changes computed for one event, installed only once every column succeeded.
#[derive(Debug, Default)]
struct StagedUpdate {
    accumulators: HashMap<String, AccumulatorValue>,
    derived: Record,
}

impl StagedUpdate {
    fn commit(self, cell: &StateCell) {
        for (column, acc) in self.accumulators {
            cell.aggregate_state.insert(column, acc);
        }
        cell.put_derived_values(self.derived);
    }
}

impl StateCell {
    /// Applies one event.
    ///
    /// Returns `Rejected` when the ordering guard drops the event. An error
    /// leaves the cell untouched, offsets included.
    pub fn apply(&self, config: &WindowConfig, event: &Event) -> Result<ApplyOutcome> {
        let mut row = event.fields.clone();
        row.insert(
            WINDOW_START_FIELD.to_string(),
            ScalarValue::TimestampMillisecond(Some(self.window_start), None),
        );
        row.insert(
            WINDOW_END_FIELD.to_string(),
            ScalarValue::TimestampMillisecond(Some(self.window_end), None),
        );

        let offset = match &event.offset {
            Some(offset) if !offset.is_empty() => offset.clone(),
            _ => Offset::wall_clock(),
        };
        if !self.ordering.admits(&event.partition_id, &offset) {
            tracing::warn!(
                cell = %self.identity(),
                partition = %event.partition_id,
                max_offset = ?self.ordering.get(&event.partition_id).map(|o| o.to_string()),
                offset = %offset,
                "out of order event dropped"
            );
            return Ok(ApplyOutcome::Rejected);
        }

        let occurred_at = config.time_policy.occurrence_time(&row);

        if let Some(reducer) = &config.reducer {
            let previous = if self.derived_values.is_empty() {
                None
            } else {
                Some(self.derived_snapshot())
            };
            let reduced = reducer
                .reduce(previous.as_ref(), &row)
                .with_context(|| format!("{}: reducer failed", self.identity()))?;
            self.ordering.advance(&event.partition_id, offset);
            self.set_last_update_time(occurred_at);
            self.replace_derived_values(reduced);
            return Ok(ApplyOutcome::Applied);
        }

        let staged = self
            .stage(config, &mut row)
            .with_context(|| format!("{}: failed computing event", self.identity()))?;

        self.ordering.advance(&event.partition_id, offset);
        self.set_last_update_time(occurred_at);
        staged.commit(self);
        Ok(ApplyOutcome::Applied)
    }

    /// Folds an already aggregated partial cell into this one.
    pub fn apply_partial_state(&self, config: &WindowConfig, other: &StateCell) -> Result<()> {
        let merged = StateCell::merge(config, &[self, other])
            .with_context(|| format!("{}: failed absorbing {}", self.identity(), other.identity()))?;
        for (column, acc) in merged.aggregate_snapshot() {
            self.aggregate_state.insert(column, acc);
        }
        self.put_derived_values(merged.derived_snapshot());
        Ok(())
    }

    fn stage(&self, config: &WindowConfig, row: &mut Record) -> Result<StagedUpdate> {
        let mut staged = StagedUpdate::default();

        for (computed_column, steps) in config.plan.iter() {
            for step in steps {
                match step {
                    Step::Aggregate(agg) => {
                        let value = self.fold_step(agg, row, &mut staged).with_context(|| {
                            format!(
                                "aggregate '{}' failed on column '{}'",
                                agg.function.name(),
                                agg.column
                            )
                        })?;
                        row.insert(agg.column.clone(), value);
                    }
                    Step::Derived(derived) => {
                        let value = self.evaluate_step(derived, row, &staged).with_context(|| {
                            format!("expression failed on column '{}'", derived.column)
                        })?;
                        row.insert(derived.column.clone(), value);
                    }
                }
            }
            if let Some(value) = row.get(computed_column) {
                staged.derived.insert(computed_column.clone(), value.clone());
            }
        }

        for (target, source) in &config.projections {
            match row.get(source) {
                Some(value) => {
                    staged.derived.insert(target.clone(), value.clone());
                }
                None => {
                    tracing::warn!(field = %source, column = %target, "projected field missing");
                }
            }
        }

        Ok(staged)
    }

    fn fold_step(
        &self,
        agg: &AggregateStep,
        row: &Record,
        staged: &mut StagedUpdate,
    ) -> Result<ScalarValue> {
        let current = match staged.accumulators.get(&agg.column) {
            Some(acc) => acc.clone(),
            None => match self.accumulator(&agg.column) {
                Some(acc) => acc,
                None => agg.function.create_empty()?,
            },
        };
        let next = agg.function.fold(&current, &agg.input_value(row))?;
        let value = agg.function.finalize(&next)?;
        staged.accumulators.insert(agg.column.clone(), next);
        Ok(value)
    }

    fn evaluate_step(
        &self,
        derived: &DerivedStep,
        row: &mut Record,
        staged: &StagedUpdate,
    ) -> Result<ScalarValue> {
        for column in derived.expression.dependent_columns() {
            if row.contains_key(&column) {
                continue;
            }
            let known = staged
                .derived
                .get(&column)
                .cloned()
                .or_else(|| self.derived_value(&column));
            if let Some(value) = known {
                row.insert(column, value);
            }
        }
        derived.expression.evaluate(row)
    }
}
