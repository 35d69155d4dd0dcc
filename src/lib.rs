pub mod api;
pub mod common;
pub mod runtime;

pub use api::WindowSpec;
pub use common::{Event, Offset, Record};
pub use runtime::operators::window::{
    get_aggregate_registry, ApplyOutcome, StateCell, WindowConfig,
};
