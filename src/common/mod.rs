pub mod message;

pub use message::{Event, Offset, Record};

/// Epoch milliseconds.
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
