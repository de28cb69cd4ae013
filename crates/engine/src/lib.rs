//! The embedded storage engine: configuration, memory accounting, the
//! per-partition commit path, multi-partition 2PC, logical databases,
//! compaction, and the pool that ties them together (§4.7–§4.10).

pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod memory;
pub mod partition;
pub mod pool;

pub use config::EngineConfig;
pub use database::{DbOp, LogicalDb};
pub use pool::{Pool, PoolStats};
