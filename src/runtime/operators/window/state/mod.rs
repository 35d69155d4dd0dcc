pub mod apply;
pub mod cell;
pub mod codec;
pub mod merge;
pub mod ordering;

#[cfg(test)]
mod state_cell_tests;

pub use cell::{
    ApplyOutcome, CellMeta, StateCell, DEFAULT_GROUP_KEY, TRACE_ID_FIELD, WINDOW_END_FIELD,
    WINDOW_START_FIELD,
};
pub use codec::EncodedState;
pub use ordering::OrderingGuard;
