pub mod aggregates;
pub mod plan;
pub mod state;

pub use aggregates::{
    get_aggregate_registry, AccumulatorValue, AggregateFunction, AggregateRegistry,
};
pub use plan::{
    AggregateStep, BinaryOp, ColumnPlan, DerivedStep, Expr, Expression, Reducer, Step,
    TimePolicy, WindowConfig,
};
pub use state::{ApplyOutcome, CellMeta, EncodedState, OrderingGuard, StateCell};
