//! A logical database: its partitions, catalog entry, transaction manager,
//! and memory account (§4.9 "Logical DB").
//!
//! Routing is the simplest possible rule named in the design notes:
//! `partition_id = doc_id % partition_count`. A transaction whose ops all
//! hash to one partition commits through `Partition::commit` directly; one
//! that spans more than one partition goes through the 2PC coordinator.

use crate::coordinator;
use crate::memory::{GlobalMemory, MemoryAccount};
use crate::partition::{Partition, WriteOp};
use docdb_concurrency::{Transaction, TransactionManager};
use docdb_core::error::Result;
use docdb_core::ids::{DbId, PartitionId, TxId};
use docdb_durability::FsyncMode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A single document write, named at the database level before routing.
#[derive(Debug, Clone)]
pub enum DbOp {
    Create { collection: String, doc_id: u64, payload: Vec<u8> },
    Read { collection: String, doc_id: u64 },
    Update { collection: String, doc_id: u64, payload: Vec<u8> },
    Delete { collection: String, doc_id: u64 },
}

impl DbOp {
    fn doc_id(&self) -> u64 {
        match self {
            DbOp::Create { doc_id, .. }
            | DbOp::Read { doc_id, .. }
            | DbOp::Update { doc_id, .. }
            | DbOp::Delete { doc_id, .. } => *doc_id,
        }
    }

    fn payload_len(&self) -> u64 {
        match self {
            DbOp::Create { payload, .. } | DbOp::Update { payload, .. } => payload.len() as u64,
            DbOp::Read { .. } | DbOp::Delete { .. } => 0,
        }
    }

    fn into_write_op(self) -> Option<WriteOp> {
        match self {
            DbOp::Create { collection, doc_id, payload } => {
                Some(WriteOp::Create { collection, doc_id, payload })
            }
            DbOp::Update { collection, doc_id, payload } => {
                Some(WriteOp::Update { collection, doc_id, payload })
            }
            DbOp::Delete { collection, doc_id } => Some(WriteOp::Delete { collection, doc_id }),
            DbOp::Read { .. } => None,
        }
    }
}

/// One open logical database: a fixed set of partitions opened at
/// creation time, a shared transaction manager, and a memory account
/// charged against the pool's global cap.
pub struct LogicalDb {
    id: DbId,
    dir: PathBuf,
    partitions: Vec<Partition>,
    txn_manager: TransactionManager,
    memory: MemoryAccount,
}

fn route(doc_id: u64, partition_count: usize) -> PartitionId {
    PartitionId((doc_id % partition_count as u64) as u16)
}

impl LogicalDb {
    /// Open every partition under `dir`, replaying each one's WAL, and
    /// resume the transaction manager from the highest `tx_id` any
    /// partition observed.
    pub fn open(
        id: DbId,
        dir: &Path,
        partition_count: u16,
        wal_rotation_size_bytes: u64,
        checkpoint_interval_bytes: u64,
        fsync_mode: FsyncMode,
        shard_count: usize,
        per_db_memory_cap_bytes: u64,
        global_memory: Arc<GlobalMemory>,
    ) -> Result<Self> {
        let mut partitions = Vec::with_capacity(partition_count as usize);
        let mut max_tx_id = TxId::ZERO;
        for n in 0..partition_count {
            let (partition, recovered) = Partition::open(
                dir,
                PartitionId(n),
                wal_rotation_size_bytes,
                checkpoint_interval_bytes,
                fsync_mode,
                shard_count,
            )?;
            if recovered.max_tx_id > max_tx_id {
                max_tx_id = recovered.max_tx_id;
            }
            partitions.push(partition);
        }

        Ok(LogicalDb {
            id,
            dir: dir.to_path_buf(),
            partitions,
            txn_manager: TransactionManager::recovered(max_tx_id),
            memory: MemoryAccount::new(per_db_memory_cap_bytes, global_memory),
        })
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, id: PartitionId) -> &Partition {
        &self.partitions[id.0 as usize]
    }

    /// Read a single document at the database's current commit watermark.
    pub fn read(&self, collection: &str, doc_id: u64) -> Result<Option<Vec<u8>>> {
        let snapshot = self.txn_manager.max_committed_tx_id();
        let partition = self.partition(route(doc_id, self.partitions.len()));
        partition.read(collection, doc_id, snapshot)
    }

    /// Execute a batch of ops as one transaction. Reads are resolved
    /// against the transaction's snapshot and recorded into its read-set;
    /// writes are grouped by the partition they route to. A batch that
    /// routes entirely to one partition commits there directly; one that
    /// spans multiple partitions goes through the 2PC coordinator.
    pub fn execute(&self, ops: Vec<DbOp>) -> Result<Vec<Option<Vec<u8>>>> {
        let snapshot = self.txn_manager.max_committed_tx_id();
        let mut txn = Transaction::new(TxId(0), snapshot);
        let mut reads = Vec::with_capacity(ops.len());
        let mut writes_by_partition: HashMap<PartitionId, Vec<WriteOp>> = HashMap::new();

        for op in &ops {
            let partition_id = route(op.doc_id(), self.partitions.len());
            match op {
                DbOp::Read { collection, doc_id } => {
                    txn.record_read(collection, *doc_id);
                    reads.push(self.partition(partition_id).read(collection, *doc_id, snapshot)?);
                }
                _ => {
                    if matches!(op, DbOp::Update { .. } | DbOp::Delete { .. }) {
                        txn.record_read(op_collection(op), op.doc_id());
                    }
                    txn.record_write(op_collection(op), op.doc_id());
                    reads.push(None);
                }
            }
        }

        for op in ops {
            let partition_id = route(op.doc_id(), self.partitions.len());
            let existing_len = match &op {
                DbOp::Update { collection, doc_id, .. } | DbOp::Delete { collection, doc_id, .. } => {
                    self.partition(partition_id)
                        .index()
                        .lookup(collection, *doc_id, TxId::MAX)
                        .map(|v| v.length as u64)
                        .unwrap_or(0)
                }
                _ => 0,
            };
            match &op {
                DbOp::Create { .. } => self.memory.try_allocate(op.payload_len())?,
                DbOp::Update { .. } => self.memory.try_resize(existing_len, op.payload_len())?,
                DbOp::Delete { .. } => self.memory.free(existing_len),
                DbOp::Read { .. } => {}
            }
            if let Some(write_op) = op.into_write_op() {
                writes_by_partition.entry(partition_id).or_default().push(write_op);
            }
        }

        if writes_by_partition.is_empty() {
            return Ok(reads);
        }

        let tx_id = self.txn_manager.allocate_tx_id();
        // Conflict check must happen before anything is written: once the
        // WAL commit record lands and the index is published, a later
        // SerializationFailure here would only report a lie, not prevent one.
        self.txn_manager.validate(tx_id, &txn)?;
        if writes_by_partition.len() == 1 {
            let (partition_id, write_ops) = writes_by_partition.into_iter().next().unwrap();
            self.partition(partition_id).commit(self.id, tx_id, write_ops)?;
        } else {
            let grouped: HashMap<PartitionId, (&Partition, Vec<WriteOp>)> = writes_by_partition
                .into_iter()
                .map(|(id, ops)| (id, (self.partition(id), ops)))
                .collect();
            coordinator::run_transaction(&self.dir, self.id, tx_id, grouped)?;
        }

        self.txn_manager.record_commit(tx_id, &txn);
        Ok(reads)
    }

    pub fn memory(&self) -> &MemoryAccount {
        &self.memory
    }

    pub fn total_live_count(&self) -> i64 {
        self.partitions.iter().map(|p| p.index().total_live_count()).sum()
    }
}

fn op_collection(op: &DbOp) -> &str {
    match op {
        DbOp::Create { collection, .. }
        | DbOp::Read { collection, .. }
        | DbOp::Update { collection, .. }
        | DbOp::Delete { collection, .. } => collection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(dir: &Path, partition_count: u16) -> LogicalDb {
        LogicalDb::open(
            DbId(1),
            dir,
            partition_count,
            1024 * 1024,
            1024 * 1024 * 1024,
            FsyncMode::Always,
            4,
            1024 * 1024,
            Arc::new(GlobalMemory::new(1024 * 1024 * 1024)),
        )
        .unwrap()
    }

    #[test]
    fn single_partition_create_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 1);
        db.execute(vec![DbOp::Create {
            collection: "c".into(),
            doc_id: 1,
            payload: br#"{"a":1}"#.to_vec(),
        }])
        .unwrap();
        let got = db.read("c", 1).unwrap().unwrap();
        assert_eq!(got, br#"{"a":1}"#);
    }

    #[test]
    fn writes_spanning_partitions_use_the_coordinator() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);
        // doc_id 0 and 1 route to different partitions under 4 partitions.
        db.execute(vec![
            DbOp::Create { collection: "c".into(), doc_id: 0, payload: b"{}".to_vec() },
            DbOp::Create { collection: "c".into(), doc_id: 1, payload: b"{}".to_vec() },
        ])
        .unwrap();
        assert!(db.read("c", 0).unwrap().is_some());
        assert!(db.read("c", 1).unwrap().is_some());
    }

    #[test]
    fn update_without_existing_document_fails_not_found() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 1);
        let err = db
            .execute(vec![DbOp::Update { collection: "c".into(), doc_id: 1, payload: b"{}".to_vec() }])
            .unwrap_err();
        assert!(matches!(err, docdb_core::error::Error::NotFound));
    }

    #[test]
    fn recovery_resumes_tx_allocator_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = open_db(dir.path(), 1);
            db.execute(vec![DbOp::Create { collection: "c".into(), doc_id: 1, payload: b"{}".to_vec() }])
                .unwrap();
        }
        let db = open_db(dir.path(), 1);
        assert!(db.read("c", 1).unwrap().is_some());
        // A second create for the same doc must still fail: recovery
        // rebuilt the index, it didn't just reset the tx allocator.
        let err = db
            .execute(vec![DbOp::Create { collection: "c".into(), doc_id: 1, payload: b"{}".to_vec() }])
            .unwrap_err();
        assert!(matches!(err, docdb_core::error::Error::AlreadyExists));
    }
}
