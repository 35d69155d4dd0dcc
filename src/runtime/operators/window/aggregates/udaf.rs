use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema};
use datafusion::logical_expr::function::AccumulatorArgs;
use datafusion::logical_expr::{Accumulator, AggregateUDF};
use datafusion::physical_expr::expressions::Column;
use datafusion::physical_expr::{LexOrdering, PhysicalExpr};
use datafusion::scalar::ScalarValue;

use super::{AccumulatorValue, AggregateFunction};

/// Runs a DataFusion aggregate UDF as an [`AggregateFunction`].
///
/// The DataFusion accumulator is rebuilt from the stored state for every
/// operation and snapshotted back through `Accumulator::state`, so the cell
/// only ever holds plain scalars.
pub struct UdafAggregate {
    udaf: Arc<AggregateUDF>,
    input_type: DataType,
    return_type: DataType,
}

impl fmt::Debug for UdafAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdafAggregate")
            .field("name", &self.udaf.name())
            .field("input_type", &self.input_type)
            .field("return_type", &self.return_type)
            .finish()
    }
}

impl UdafAggregate {
    pub fn try_new(udaf: Arc<AggregateUDF>, input_type: DataType) -> Result<Self> {
        let coerced = if udaf.name().eq_ignore_ascii_case("count") {
            vec![input_type]
        } else {
            udaf.coerce_types(&[input_type])?
        };
        let input_type = coerced
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("failed to coerce input type for {}", udaf.name()))?;
        let return_type = udaf.return_type(&[input_type.clone()])?;
        Ok(Self {
            udaf,
            input_type,
            return_type,
        })
    }

    fn build_accumulator(&self) -> Result<Box<dyn Accumulator>> {
        let input_field = Field::new("value", self.input_type.clone(), true);
        let schema = Schema::new(vec![input_field]);
        let exprs: Vec<Arc<dyn PhysicalExpr>> = vec![Arc::new(Column::new("value", 0))];
        let return_field = Arc::new(Field::new("out", self.return_type.clone(), true));
        let ordering_req = LexOrdering::default();
        let acc_args = AccumulatorArgs {
            return_field,
            schema: &schema,
            ignore_nulls: false,
            ordering_req: &ordering_req,
            is_reversed: false,
            name: self.udaf.name(),
            is_distinct: false,
            exprs: &exprs,
        };
        Ok(self.udaf.accumulator(acc_args)?)
    }

    fn restore(&self, acc: &AccumulatorValue) -> Result<Box<dyn Accumulator>> {
        let mut accumulator = self.build_accumulator()?;
        merge_state(accumulator.as_mut(), acc)?;
        Ok(accumulator)
    }

    fn input_array(&self, value: &ScalarValue) -> Result<ArrayRef> {
        let value = if value.is_null() {
            ScalarValue::try_from(&self.input_type)?
        } else if value.data_type() == self.input_type {
            value.clone()
        } else {
            value.cast_to(&self.input_type).with_context(|| {
                format!("cannot feed {:?} into {}", value.data_type(), self.udaf.name())
            })?
        };
        Ok(value.to_array_of_size(1)?)
    }
}

fn merge_state(accumulator: &mut dyn Accumulator, acc: &AccumulatorValue) -> Result<()> {
    let state_arrays = acc
        .state()
        .iter()
        .map(|scalar| scalar.to_array_of_size(1))
        .collect::<datafusion::common::Result<Vec<ArrayRef>>>()?;
    accumulator.merge_batch(&state_arrays)?;
    Ok(())
}

fn snapshot(accumulator: &mut dyn Accumulator) -> Result<AccumulatorValue> {
    Ok(AccumulatorValue::from_state(accumulator.state()?))
}

impl AggregateFunction for UdafAggregate {
    fn name(&self) -> &str {
        self.udaf.name()
    }

    fn create_empty(&self) -> Result<AccumulatorValue> {
        let mut accumulator = self.build_accumulator()?;
        snapshot(accumulator.as_mut())
    }

    fn fold(&self, acc: &AccumulatorValue, value: &ScalarValue) -> Result<AccumulatorValue> {
        let mut accumulator = self.restore(acc)?;
        accumulator.update_batch(&[self.input_array(value)?])?;
        snapshot(accumulator.as_mut())
    }

    fn merge_many(&self, accs: &[AccumulatorValue]) -> Result<AccumulatorValue> {
        let mut accumulator = self.build_accumulator()?;
        for acc in accs {
            merge_state(accumulator.as_mut(), acc)?;
        }
        snapshot(accumulator.as_mut())
    }

    fn finalize(&self, acc: &AccumulatorValue) -> Result<ScalarValue> {
        let mut accumulator = self.restore(acc)?;
        Ok(accumulator.evaluate()?)
    }
}
