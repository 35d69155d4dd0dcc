pub mod spec;

pub use spec::window_spec::{
    AggregateSpec, ColumnSpec, DerivedSpec, ExprSpec, StepSpec, WindowSpec,
};
