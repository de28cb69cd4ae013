//! Write-ahead log: segment naming, the per-partition writer, and the
//! sequential reader used by recovery.

pub mod mode;
pub mod reader;
pub mod segment;
pub mod writer;

pub use mode::FsyncMode;
pub use reader::{read_segment_tolerant, ReadOutcome, WalSegmentReader};
pub use writer::WalWriter;
