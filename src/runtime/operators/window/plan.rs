use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use arrow::datatypes::DataType;
use datafusion::scalar::ScalarValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::common::{now_millis, Record, Timestamp};
use crate::runtime::operators::window::aggregates::AggregateFunction;
use crate::runtime::utils::scalar_to_millis;

/// Source column name meaning "every event", as in `count(*)`.
pub const WILDCARD_COLUMN: &str = "*";

/// An expression evaluated over a row of already materialized columns.
pub trait Expression: Send + Sync + fmt::Debug {
    /// Columns the expression reads.
    fn dependent_columns(&self) -> Vec<String>;

    fn evaluate(&self, row: &Record) -> Result<ScalarValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Arithmetic over columns and literals.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(ScalarValue),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn literal(value: ScalarValue) -> Self {
        Expr::Literal(value)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Column(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
        }
    }
}

// Mixed operand types are computed in Float64.
fn align_operands(left: ScalarValue, right: ScalarValue) -> Result<(ScalarValue, ScalarValue)> {
    if left.data_type() == right.data_type() || left.is_null() || right.is_null() {
        return Ok((left, right));
    }
    Ok((
        left.cast_to(&DataType::Float64)?,
        right.cast_to(&DataType::Float64)?,
    ))
}

impl Expression for Expr {
    fn dependent_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn evaluate(&self, row: &Record) -> Result<ScalarValue> {
        match self {
            Expr::Column(name) => row
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("column '{}' is not available", name)),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Binary { op, left, right } => {
                let (l, r) = align_operands(left.evaluate(row)?, right.evaluate(row)?)?;
                if l.is_null() || r.is_null() {
                    return Ok(ScalarValue::try_from(&l.data_type())
                        .or_else(|_| ScalarValue::try_from(&r.data_type()))?);
                }
                let value = match op {
                    BinaryOp::Add => l.add(&r)?,
                    BinaryOp::Sub => l.sub(&r)?,
                    BinaryOp::Mul => l.mul(&r)?,
                    BinaryOp::Div => l.div(&r)?,
                };
                Ok(value)
            }
        }
    }
}

/// Whole-record reduction used instead of a column plan.
pub trait Reducer: Send + Sync + fmt::Debug {
    fn reduce(&self, previous: Option<&Record>, event: &Record) -> Result<Record>;
}

/// How the occurrence time of an event is determined.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePolicy {
    #[default]
    ProcessingTime,
    EventTime { field: String },
}

impl TimePolicy {
    pub fn occurrence_time(&self, row: &Record) -> Timestamp {
        match self {
            TimePolicy::ProcessingTime => now_millis(),
            TimePolicy::EventTime { field } => match row.get(field).and_then(scalar_to_millis) {
                Some(ts) => ts,
                None => {
                    tracing::debug!(field = %field, "event time missing, using processing time");
                    now_millis()
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateStep {
    pub column: String,
    pub source_column: String,
    pub function: Arc<dyn AggregateFunction>,
}

impl AggregateStep {
    pub fn new(
        column: impl Into<String>,
        source_column: impl Into<String>,
        function: Arc<dyn AggregateFunction>,
    ) -> Self {
        Self {
            column: column.into(),
            source_column: source_column.into(),
            function,
        }
    }

    /// Value folded into the accumulator for `row`.
    pub fn input_value(&self, row: &Record) -> ScalarValue {
        if self.source_column == WILDCARD_COLUMN {
            return ScalarValue::Int64(Some(1));
        }
        row.get(&self.source_column)
            .cloned()
            .unwrap_or(ScalarValue::Null)
    }
}

#[derive(Debug, Clone)]
pub struct DerivedStep {
    pub column: String,
    pub expression: Arc<dyn Expression>,
}

impl DerivedStep {
    pub fn new(column: impl Into<String>, expression: Arc<dyn Expression>) -> Self {
        Self {
            column: column.into(),
            expression,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Aggregate(AggregateStep),
    Derived(DerivedStep),
}

impl Step {
    pub fn column(&self) -> &str {
        match self {
            Step::Aggregate(step) => &step.column,
            Step::Derived(step) => &step.column,
        }
    }
}

/// Computed columns in evaluation order, each with its chain of steps.
#[derive(Debug, Clone, Default)]
pub struct ColumnPlan {
    columns: IndexMap<String, Vec<Step>>,
}

impl ColumnPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_column(&mut self, column: impl Into<String>, steps: Vec<Step>) -> Result<()> {
        let column = column.into();
        if self.columns.contains_key(&column) {
            bail!("column '{}' is declared twice", column);
        }
        self.columns.insert(column, steps);
        Ok(())
    }

    pub fn with_column(mut self, column: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        self.push_column(column, steps)?;
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Step>)> {
        self.columns.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn aggregate_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.values().flatten().filter_map(|step| match step {
            Step::Aggregate(agg) => Some(agg.column.as_str()),
            Step::Derived(_) => None,
        })
    }
}

/// Everything a cell needs to know about its window definition.
#[derive(Debug, Clone, Default)]
pub struct WindowConfig {
    pub plan: ColumnPlan,
    /// target column -> source field
    pub projections: IndexMap<String, String>,
    pub reducer: Option<Arc<dyn Reducer>>,
    pub time_policy: TimePolicy,
}

impl WindowConfig {
    pub fn new(plan: ColumnPlan) -> Self {
        Self {
            plan,
            ..Default::default()
        }
    }

    pub fn with_projection(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.projections.insert(target.into(), source.into());
        self
    }

    pub fn with_reducer(mut self, reducer: Arc<dyn Reducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn with_time_policy(mut self, time_policy: TimePolicy) -> Self {
        self.time_policy = time_policy;
        self
    }
}
