use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use arrow::datatypes::DataType;
use datafusion::functions_aggregate::{
    average::avg_udaf,
    count::count_udaf,
    min_max::{max_udaf, min_udaf},
    sum::sum_udaf,
};
use datafusion::logical_expr::AggregateUDF;
use datafusion::scalar::ScalarValue;

pub mod udaf;


pub use udaf::UdafAggregate;

/// Incremental state of one aggregate on one column.
///
/// Single-field states are `Primitive`; states made of several fields (for
/// example `avg` keeps a count and a sum) are `Structured`.
#[derive(Debug, Clone, PartialEq)]
pub enum AccumulatorValue {
    Primitive(ScalarValue),
    Structured(Vec<ScalarValue>),
}

impl AccumulatorValue {
    pub fn from_state(mut state: Vec<ScalarValue>) -> Self {
        if state.len() == 1 {
            AccumulatorValue::Primitive(state.remove(0))
        } else {
            AccumulatorValue::Structured(state)
        }
    }

    pub fn state(&self) -> Vec<ScalarValue> {
        match self {
            AccumulatorValue::Primitive(v) => vec![v.clone()],
            AccumulatorValue::Structured(fields) => fields.clone(),
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, AccumulatorValue::Primitive(_))
    }
}

/// Capabilities every aggregation function must provide. `merge_many` has to
/// combine partial accumulators without the raw events, this is what lets
/// cells from different partitions be merged at fire time.
pub trait AggregateFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn create_empty(&self) -> Result<AccumulatorValue>;

    fn fold(&self, acc: &AccumulatorValue, value: &ScalarValue) -> Result<AccumulatorValue>;

    fn merge_many(&self, accs: &[AccumulatorValue]) -> Result<AccumulatorValue>;

    fn finalize(&self, acc: &AccumulatorValue) -> Result<ScalarValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggKind {
    pub fn udaf(&self) -> Arc<AggregateUDF> {
        match self {
            AggKind::Count => count_udaf(),
            AggKind::Sum => sum_udaf(),
            AggKind::Avg => avg_udaf(),
            AggKind::Min => min_udaf(),
            AggKind::Max => max_udaf(),
        }
    }
}

pub type AggregateFactory =
    Arc<dyn Fn(&DataType) -> Result<Arc<dyn AggregateFunction>> + Send + Sync>;

pub struct AggregateRegistry {
    factories: HashMap<String, AggregateFactory>,
}

impl fmt::Debug for AggregateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRegistry")
            .field("functions", &self.supported_functions())
            .finish()
    }
}

impl Default for AggregateRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register_supported_aggregates();
        registry
    }
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    fn register_supported_aggregates(&mut self) {
        self.register_kind("count", AggKind::Count);
        self.register_kind("sum", AggKind::Sum);
        self.register_kind("avg", AggKind::Avg);
        self.register_kind("min", AggKind::Min);
        self.register_kind("max", AggKind::Max);
    }

    fn register_kind(&mut self, name: &str, kind: AggKind) {
        self.register(name, move |input_type: &DataType| {
            let function: Arc<dyn AggregateFunction> =
                Arc::new(UdafAggregate::try_new(kind.udaf(), input_type.clone())?);
            Ok(function)
        });
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DataType) -> Result<Arc<dyn AggregateFunction>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_lowercase(), Arc::new(factory));
    }

    /// Registers any DataFusion aggregate UDF under `name`.
    pub fn register_udaf(&mut self, name: &str, udaf: Arc<AggregateUDF>) {
        self.register(name, move |input_type: &DataType| {
            let function: Arc<dyn AggregateFunction> =
                Arc::new(UdafAggregate::try_new(udaf.clone(), input_type.clone())?);
            Ok(function)
        });
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    pub fn supported_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Binds the function `name` to the type of the values it will consume.
    pub fn resolve(&self, name: &str, input_type: &DataType) -> Result<Arc<dyn AggregateFunction>> {
        let factory = self
            .factories
            .get(&name.to_lowercase())
            .ok_or_else(|| {
                anyhow!(
                    "Unsupported aggregate function: {} (supported: {})",
                    name,
                    self.supported_functions().join(", ")
                )
            })?;
        factory(input_type)
    }
}

pub fn get_aggregate_registry() -> &'static AggregateRegistry {
    static REGISTRY: std::sync::OnceLock<AggregateRegistry> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(AggregateRegistry::default)
}
