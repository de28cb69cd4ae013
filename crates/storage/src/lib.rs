//! The append-only data file and sharded MVCC index (§4.2, §4.5).

pub mod datafile;
pub mod index;

pub use datafile::DataFile;
pub use index::{DocKey, ShardedIndex, Version, VersionChain};
