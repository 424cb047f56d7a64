//! Data storage.
pub mod buffer;

pub use buffer::{RangeEnd, RangeStart, SharedBuffer, StoredReading, StreamStats, StreamWriter};
