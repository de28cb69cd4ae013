//! WAL codec, writer/reader, checkpoints, catalog, and crash recovery (§4.1–§4.4).

pub mod catalog;
pub mod checkpoint;
pub mod record;
pub mod recovery;
pub mod wal;

pub use catalog::{CatalogEntry, DbStatus};
pub use checkpoint::{Checkpoint, read_checkpoint, write_checkpoint};
pub use record::WalRecord;
pub use recovery::{recover_partition, RecoveredPartition};
pub use wal::{FsyncMode, WalWriter};
