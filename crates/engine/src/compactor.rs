//! Data file compaction (§4.10).
//!
//! Thin wrapper around [`Partition::compact`]: the heavy lifting (reading
//! live payloads, rewriting them into a `.compact` sibling, swapping the
//! file in, remapping the index) lives on `Partition` itself since it needs
//! access to the partition's write lock and data file handle.

use crate::partition::Partition;
use docdb_core::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub records_rewritten: usize,
}

/// Run compaction for one partition's data file.
pub fn compact(partition: &Partition) -> Result<CompactionStats> {
    let records_rewritten = partition.compact()?;
    Ok(CompactionStats { records_rewritten })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::WriteOp;
    use docdb_core::ids::{DbId, PartitionId, TxId};
    use docdb_durability::FsyncMode;
    use tempfile::tempdir;

    #[test]
    fn compaction_preserves_live_documents_and_drops_dead_versions() {
        let dir = tempdir().unwrap();
        let (partition, _) =
            Partition::open(dir.path(), PartitionId(0), 1024 * 1024, 1024 * 1024 * 1024, FsyncMode::Always, 4)
                .unwrap();

        partition
            .commit(
                DbId(1),
                TxId(1),
                vec![WriteOp::Create { collection: "c".into(), doc_id: 1, payload: b"{\"v\":1}".to_vec() }],
            )
            .unwrap();
        partition
            .commit(
                DbId(1),
                TxId(2),
                vec![WriteOp::Update { collection: "c".into(), doc_id: 1, payload: b"{\"v\":2}".to_vec() }],
            )
            .unwrap();
        partition
            .commit(
                DbId(1),
                TxId(3),
                vec![WriteOp::Create { collection: "c".into(), doc_id: 2, payload: b"{\"v\":9}".to_vec() }],
            )
            .unwrap();
        partition
            .commit(DbId(1), TxId(4), vec![WriteOp::Delete { collection: "c".into(), doc_id: 2 }])
            .unwrap();

        let stats = compact(&partition).unwrap();
        assert_eq!(stats.records_rewritten, 1);

        assert_eq!(partition.read("c", 1, TxId::MAX).unwrap().unwrap(), b"{\"v\":2}");
        assert!(partition.read("c", 2, TxId::MAX).unwrap().is_none());
    }

    #[test]
    fn compaction_survives_reads_through_the_swapped_file() {
        let dir = tempdir().unwrap();
        let (partition, _) =
            Partition::open(dir.path(), PartitionId(0), 1024 * 1024, 1024 * 1024 * 1024, FsyncMode::Always, 4)
                .unwrap();
        for doc_id in 1..=5u64 {
            partition
                .commit(
                    DbId(1),
                    TxId(doc_id),
                    vec![WriteOp::Create { collection: "c".into(), doc_id, payload: b"{}".to_vec() }],
                )
                .unwrap();
        }
        compact(&partition).unwrap();
        for doc_id in 1..=5u64 {
            assert!(partition.read("c", doc_id, TxId::MAX).unwrap().is_some());
        }
        // Compaction must not disturb the partition's ability to accept
        // further writes against its freshly swapped-in data file.
        partition
            .commit(
                DbId(1),
                TxId(6),
                vec![WriteOp::Create { collection: "c".into(), doc_id: 6, payload: b"{}".to_vec() }],
            )
            .unwrap();
        assert!(partition.read("c", 6, TxId::MAX).unwrap().is_some());
    }
}
