pub mod operators;
pub mod utils;
