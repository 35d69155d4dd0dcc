use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow::datatypes::DataType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::runtime::operators::window::aggregates::AggregateRegistry;
use crate::runtime::operators::window::plan::{
    AggregateStep, BinaryOp, ColumnPlan, DerivedStep, Expr, Step, TimePolicy, WindowConfig,
};
use crate::runtime::utils::{scalar_from_json, PrimitiveType};

pub const DEFAULT_INPUT_TYPE: &str = "int64";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprSpec {
    Binary {
        op: BinaryOp,
        left: Box<ExprSpec>,
        right: Box<ExprSpec>,
    },
    Column {
        column: String,
    },
    Literal {
        literal: serde_json::Value,
    },
}

impl ExprSpec {
    pub fn to_expr(&self) -> Result<Expr> {
        Ok(match self {
            ExprSpec::Binary { op, left, right } => {
                Expr::binary(*op, left.to_expr()?, right.to_expr()?)
            }
            ExprSpec::Column { column } => Expr::column(column.clone()),
            ExprSpec::Literal { literal } => Expr::literal(scalar_from_json(literal)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub function: String,
    pub source: String,
    /// Type name of the source values, e.g. `int64` or `float64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    /// Name of the intermediate column. Defaults to the owning column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DerivedSpec {
    pub expr: ExprSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Aggregate { aggregate: AggregateSpec },
    Derived { derived: DerivedSpec },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

/// Declarative description of the columns a window computes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSpec {
    pub columns: Vec<ColumnSpec>,
    /// target column -> source field
    pub projections: IndexMap<String, String>,
    /// Event field carrying the occurrence time. Processing time when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_field: Option<String>,
}

impl WindowSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("invalid window spec")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize window spec")
    }

    /// Resolves functions and types and checks the columns for collisions.
    pub fn build(&self, registry: &AggregateRegistry) -> Result<WindowConfig> {
        let mut plan = ColumnPlan::new();
        for column in &self.columns {
            if column.steps.is_empty() {
                bail!("column '{}' has no steps", column.name);
            }
            let steps = column
                .steps
                .iter()
                .map(|step| build_step(&column.name, step, registry))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("invalid column '{}'", column.name))?;
            plan.push_column(column.name.clone(), steps)?;
        }

        let mut aggregate_columns = HashSet::new();
        for column in plan.aggregate_columns() {
            if !aggregate_columns.insert(column) {
                bail!("aggregate column '{}' is declared twice", column);
            }
        }

        for target in self.projections.keys() {
            if aggregate_columns.contains(target.as_str())
                || self.columns.iter().any(|c| &c.name == target)
            {
                bail!("projection '{}' collides with a computed column", target);
            }
        }
        let aggregates = aggregate_columns.len();

        let mut config = WindowConfig::new(plan);
        for (target, source) in &self.projections {
            config = config.with_projection(target.clone(), source.clone());
        }
        if let Some(field) = &self.time_field {
            config = config.with_time_policy(TimePolicy::EventTime {
                field: field.clone(),
            });
        }

        tracing::debug!(
            columns = self.columns.len(),
            aggregates,
            projections = self.projections.len(),
            "built window config"
        );
        Ok(config)
    }
}

fn input_type(name: Option<&str>) -> Result<DataType> {
    let name = name.unwrap_or(DEFAULT_INPUT_TYPE);
    PrimitiveType::from_name(name)
        .map(|t| t.data_type())
        .ok_or_else(|| anyhow!("unknown input type '{}'", name))
}

fn build_step(owner: &str, step: &StepSpec, registry: &AggregateRegistry) -> Result<Step> {
    match step {
        StepSpec::Aggregate { aggregate } => {
            let data_type = input_type(aggregate.input_type.as_deref())?;
            let function = registry.resolve(&aggregate.function, &data_type)?;
            let column = aggregate.column.clone().unwrap_or_else(|| owner.to_string());
            Ok(Step::Aggregate(AggregateStep::new(
                column,
                aggregate.source.clone(),
                function,
            )))
        }
        StepSpec::Derived { derived } => {
            let column = derived.column.clone().unwrap_or_else(|| owner.to_string());
            Ok(Step::Derived(DerivedStep::new(
                column,
                Arc::new(derived.expr.to_expr()?),
            )))
        }
    }
}
