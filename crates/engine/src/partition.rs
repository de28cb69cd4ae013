//! Single-partition commit path (§4.7) and two-phase-commit participant
//! hooks (§4.8).
//!
//! A `Partition` bundles the data file, MVCC index, and WAL writer for one
//! `(db_id, partition_id)` pair. `write_lock` is the partition's single
//! serialized writer (I1): every commit, single-op or prepared, takes it
//! for the whole critical section. Once that invariant holds, `DataFile`
//! and `ShardedIndex` need no locking of their own for reads — only the
//! write side ever touches `write_lock`.
//!
//! Transaction ids and snapshots are *not* owned here: the spec places the
//! transaction manager at the database level (one allocator and one commit
//! watermark shared by every partition of a database), so callers pass in
//! an already-allocated `tx_id` and read it back out via `TxId::MAX` for
//! "what's currently committed" precondition checks.

use docdb_core::error::{Error, Result};
use docdb_core::ids::{DbId, DocId, Lsn, PartitionId, TxId};
use docdb_core::json::validate_payload;
use docdb_core::limits::normalize_collection_name;
use docdb_core::op::OpType;
use docdb_durability::{
    recover_partition, write_checkpoint, Checkpoint, FsyncMode, RecoveredPartition, WalRecord,
    WalWriter,
};
use docdb_storage::{write_compacted, DataFile, ShardedIndex, Version};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One document operation within a commit.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Create {
        collection: String,
        doc_id: u64,
        payload: Vec<u8>,
    },
    Update {
        collection: String,
        doc_id: u64,
        payload: Vec<u8>,
    },
    Delete {
        collection: String,
        doc_id: u64,
    },
}

impl WriteOp {
    fn doc_id(&self) -> u64 {
        match self {
            WriteOp::Create { doc_id, .. } => *doc_id,
            WriteOp::Update { doc_id, .. } => *doc_id,
            WriteOp::Delete { doc_id, .. } => *doc_id,
        }
    }

    fn collection(&self) -> &str {
        match self {
            WriteOp::Create { collection, .. } => collection,
            WriteOp::Update { collection, .. } => collection,
            WriteOp::Delete { collection, .. } => collection,
        }
    }
}

struct WalState {
    writer: WalWriter,
    next_lsn: Lsn,
    bytes_since_checkpoint: u64,
}

pub struct Partition {
    id: PartitionId,
    dir: PathBuf,
    /// Swapped only by compaction, under `wal`'s lock; read by cloning the
    /// `Arc` under a brief read lock so ordinary reads stay effectively
    /// lock-free (no I/O ever happens while this lock is held).
    datafile: RwLock<Arc<DataFile>>,
    index: Arc<ShardedIndex>,
    wal: Mutex<WalState>,
    checkpoint_interval_bytes: u64,
}

/// A partition that has accepted a transaction's op records into its WAL
/// but not yet written the `Commit` record — held by the 2PC coordinator
/// until every participant has prepared. Holding this alive keeps the
/// partition's write lock engaged, so nothing else can interleave with
/// this transaction on this partition.
pub struct PreparedWrite<'p> {
    partition: &'p Partition,
    guard: parking_lot::MutexGuard<'p, WalState>,
    tx_id: TxId,
    ops: Vec<WriteOp>,
    db_id: DbId,
}

impl Partition {
    /// Open a partition's files under `dir`, replaying its WAL to rebuild
    /// the index before any new writes are accepted.
    pub fn open(
        dir: &Path,
        partition_id: PartitionId,
        wal_rotation_size_bytes: u64,
        checkpoint_interval_bytes: u64,
        fsync_mode: FsyncMode,
        shard_count: usize,
    ) -> Result<(Self, RecoveredPartition)> {
        std::fs::create_dir_all(dir)?;
        let datafile_path = dir.join(format!("p{}.data", partition_id.0));
        let mut datafile = DataFile::open(&datafile_path)?;
        let index = ShardedIndex::new(shard_count);

        let recovered = recover_partition(dir, partition_id, &mut datafile, &index)?;

        let writer = WalWriter::open(
            dir.to_path_buf(),
            partition_id,
            recovered.last_lsn,
            wal_rotation_size_bytes,
            fsync_mode,
        )?;

        let partition = Partition {
            id: partition_id,
            dir: dir.to_path_buf(),
            datafile: RwLock::new(Arc::new(datafile)),
            index: Arc::new(index),
            wal: Mutex::new(WalState {
                writer,
                next_lsn: recovered.last_lsn.next(),
                bytes_since_checkpoint: 0,
            }),
            checkpoint_interval_bytes,
        };
        Ok((partition, recovered))
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn index(&self) -> &Arc<ShardedIndex> {
        &self.index
    }

    /// Lock-free snapshot read: the index shard lock is the only
    /// synchronization, and the data file read is a positioned read that
    /// never blocks on a concurrent writer (§5).
    pub fn read(&self, collection: &str, doc_id: u64, snapshot: TxId) -> Result<Option<Vec<u8>>> {
        let collection = normalize_collection_name(collection)?;
        match self.index.lookup(&collection, doc_id, snapshot) {
            Some(version) => self.datafile().read_at(version.data_offset),
            None => Ok(None),
        }
    }

    /// Clone the current data file handle under a brief read lock. Actual
    /// I/O always happens after this returns, outside the lock, so this
    /// never blocks on a concurrent append and only ever blocks on the rare
    /// compaction swap taking its write lock.
    fn datafile(&self) -> Arc<DataFile> {
        self.datafile.read().clone()
    }

    /// Precondition-check `op` against what's actually committed right
    /// now (`TxId::MAX`, not some reader's earlier snapshot).
    fn check_precondition(&self, op: &WriteOp) -> Result<()> {
        let collection = normalize_collection_name(op.collection())?;
        let existing = self.index.lookup(&collection, op.doc_id(), TxId::MAX);
        match (op, existing.is_some()) {
            (WriteOp::Create { .. }, true) => Err(Error::AlreadyExists),
            (WriteOp::Update { .. }, false) | (WriteOp::Delete { .. }, false) => {
                Err(Error::NotFound)
            }
            _ => Ok(()),
        }
    }

    /// Commit every op in `ops` atomically within this one partition: all
    /// preconditions are checked before anything is written, then every
    /// op's WAL record is appended followed by a single `Commit` record
    /// (I1), then the data file and index are updated. Used both for a
    /// single-operation write (§4.7, the common case of `ops.len() == 1`)
    /// and for a multi-document transaction that happens to land entirely
    /// within one partition.
    pub fn commit(&self, db_id: DbId, tx_id: TxId, ops: Vec<WriteOp>) -> Result<()> {
        for op in &ops {
            if let WriteOp::Create { payload, .. } | WriteOp::Update { payload, .. } = op {
                validate_payload(payload)?;
            }
        }

        let mut state = self.wal.lock();
        for op in &ops {
            self.check_precondition(op)?;
        }

        let mut bytes_written = 0u64;
        for op in &ops {
            bytes_written += self.append_op_record(&mut state, db_id, tx_id, op)?;
        }
        bytes_written += self.append_commit_record(&mut state, db_id, tx_id)?;

        self.apply_ops(tx_id, &ops)?;

        state.bytes_since_checkpoint += bytes_written;
        self.maybe_checkpoint(&mut state)?;
        Ok(())
    }

    /// Phase 1 of 2PC (§4.8): check preconditions and write every op's WAL
    /// record (no `Commit` yet), then hand back a guard that keeps the
    /// partition's write lock held until the coordinator decides.
    pub fn prepare(&self, db_id: DbId, tx_id: TxId, ops: Vec<WriteOp>) -> Result<PreparedWrite<'_>> {
        for op in &ops {
            if let WriteOp::Create { payload, .. } | WriteOp::Update { payload, .. } = op {
                validate_payload(payload)?;
            }
        }

        let mut state = self.wal.lock();
        for op in &ops {
            self.check_precondition(op)?;
        }
        for op in &ops {
            self.append_op_record(&mut state, db_id, tx_id, op)?;
        }

        Ok(PreparedWrite {
            partition: self,
            guard: state,
            tx_id,
            ops,
            db_id,
        })
    }

    fn append_op_record(
        &self,
        state: &mut WalState,
        db_id: DbId,
        tx_id: TxId,
        op: &WriteOp,
    ) -> Result<u64> {
        let (collection, doc_id, op_type, payload) = match op {
            WriteOp::Create { collection, doc_id, payload } => {
                (collection.as_str(), *doc_id, OpType::Create, payload.clone())
            }
            WriteOp::Update { collection, doc_id, payload } => {
                (collection.as_str(), *doc_id, OpType::Update, payload.clone())
            }
            WriteOp::Delete { collection, doc_id } => {
                (collection.as_str(), *doc_id, OpType::Delete, Vec::new())
            }
        };
        let lsn = state.next_lsn;
        state.next_lsn = lsn.next();
        let record = WalRecord::new(lsn, tx_id, db_id, collection, op_type, DocId(doc_id), payload)?;
        let encoded_len = record.encode().len() as u64;
        state.writer.append(&record)?;
        Ok(encoded_len)
    }

    fn append_commit_record(&self, state: &mut WalState, db_id: DbId, tx_id: TxId) -> Result<u64> {
        let lsn = state.next_lsn;
        state.next_lsn = lsn.next();
        let record = WalRecord::new(lsn, tx_id, db_id, "_default", OpType::Commit, DocId(0), Vec::new())?;
        let encoded_len = record.encode().len() as u64;
        state.writer.append(&record)?;
        Ok(encoded_len)
    }

    /// Data file + index side of a commit, run only after the `Commit`
    /// record is durable (I1: WAL before data file before index).
    fn apply_ops(&self, tx_id: TxId, ops: &[WriteOp]) -> Result<()> {
        let datafile = self.datafile();
        for op in ops {
            let collection = normalize_collection_name(op.collection())?;
            match op {
                WriteOp::Create { doc_id, payload, .. } => {
                    let offset = datafile.append(payload, false)?;
                    self.index.publish_create(
                        &collection,
                        *doc_id,
                        TxId::MAX,
                        Version {
                            created_tx_id: tx_id,
                            deleted_tx_id: None,
                            data_offset: offset,
                            length: payload.len() as u32,
                        },
                    )?;
                }
                WriteOp::Update { doc_id, payload, .. } => {
                    let offset = datafile.append(payload, false)?;
                    self.index.publish_update(
                        &collection,
                        *doc_id,
                        TxId::MAX,
                        Version {
                            created_tx_id: tx_id,
                            deleted_tx_id: None,
                            data_offset: offset,
                            length: payload.len() as u32,
                        },
                    )?;
                }
                WriteOp::Delete { doc_id, .. } => {
                    self.index.publish_delete(&collection, *doc_id, TxId::MAX, tx_id)?;
                }
            }
        }
        Ok(())
    }

    fn maybe_checkpoint(&self, state: &mut WalState) -> Result<()> {
        if state.bytes_since_checkpoint < self.checkpoint_interval_bytes {
            return Ok(());
        }
        let checkpoint = Checkpoint {
            last_lsn: state.writer.durable_lsn(),
            wal_size_at_checkpoint: self.datafile().len(),
        };
        write_checkpoint(&self.dir, self.id, checkpoint)?;
        state.bytes_since_checkpoint = 0;
        tracing::debug!(partition_id = self.id.0, last_lsn = checkpoint.last_lsn.0, "checkpoint written");
        Ok(())
    }

    /// Rewrite the data file keeping only currently-visible versions (§4.10):
    /// collect every live version, copy its payload into a fresh `.compact`
    /// sibling file, then swap it in under the write lock and remap the
    /// index to the new offsets. Readers never observe an offset pointing
    /// into neither file because the swap (rename + index remap) happens
    /// while `wal` is held, which is the same lock every committer takes.
    pub fn compact(&self) -> Result<usize> {
        let mut live: Vec<(String, u64, TxId, u64)> = Vec::new();
        self.index.for_each_live(TxId::MAX, |collection, doc_id, version| {
            live.push((collection.to_string(), doc_id, version.created_tx_id, version.data_offset));
        });

        let datafile = self.datafile();
        let mut entries = Vec::with_capacity(live.len());
        for (collection, doc_id, created_tx_id, old_offset) in live {
            if let Some(payload) = datafile.read_at(old_offset)? {
                entries.push((collection, doc_id, created_tx_id, old_offset, payload));
            }
        }

        let datafile_path = datafile.path().to_path_buf();
        let compact_path = datafile_path.with_extension("data.compact");
        let live_for_rewrite: Vec<(u64, Vec<u8>)> = entries
            .iter()
            .map(|(_, _, _, offset, payload)| (*offset, payload.clone()))
            .collect();

        let new_offsets = match write_compacted(&compact_path, &live_for_rewrite) {
            Ok(offsets) => offsets,
            Err(e) => {
                let _ = std::fs::remove_file(&compact_path);
                return Err(e);
            }
        };

        // Serialize with every committer for the swap: renaming over the
        // old path does not redirect any already-open file descriptor, so
        // the old `Arc<DataFile>` must be fully replaced before anyone can
        // observe the rename, and the index must be remapped before anyone
        // can read through the new one.
        let _state = self.wal.lock();
        std::fs::rename(&compact_path, &datafile_path)?;
        let reopened = Arc::new(DataFile::open(&datafile_path)?);
        for ((collection, doc_id, created_tx_id, _, _), new_offset) in entries.iter().zip(new_offsets.iter()) {
            self.index.remap_offset(collection, *doc_id, *created_tx_id, *new_offset);
        }
        *self.datafile.write() = reopened;

        tracing::info!(partition_id = self.id.0, records_rewritten = entries.len(), "compaction finished");
        Ok(entries.len())
    }
}

impl<'p> PreparedWrite<'p> {
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Phase 2, commit outcome: write the `Commit` record, then apply to
    /// the data file and index, then release the write lock.
    pub fn apply(mut self) -> Result<()> {
        let bytes_written = self
            .partition
            .append_commit_record(&mut self.guard, self.db_id, self.tx_id)?;
        self.partition.apply_ops(self.tx_id, &self.ops)?;
        self.guard.bytes_since_checkpoint += bytes_written;
        self.partition.maybe_checkpoint(&mut self.guard)?;
        Ok(())
    }

    /// Phase 2, abort outcome: release the write lock without ever writing
    /// a `Commit` record. The op records already written to the WAL are
    /// harmless garbage — recovery discards any transaction whose `Commit`
    /// record is absent (§4.4 step 7), which is exactly this case.
    pub fn abort(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_core::ids::DbId;
    use tempfile::tempdir;

    fn open_partition(dir: &Path) -> Partition {
        Partition::open(dir, PartitionId(0), 1024 * 1024, 1024 * 1024 * 1024, FsyncMode::Always, 4)
            .unwrap()
            .0
    }

    #[test]
    fn single_create_is_readable_after_commit() {
        let dir = tempdir().unwrap();
        let partition = open_partition(dir.path());
        partition
            .commit(
                DbId(1),
                TxId(1),
                vec![WriteOp::Create {
                    collection: "c".into(),
                    doc_id: 1,
                    payload: br#"{"x":1}"#.to_vec(),
                }],
            )
            .unwrap();
        let got = partition.read("c", 1, TxId::MAX).unwrap().unwrap();
        assert_eq!(got, br#"{"x":1}"#);
    }

    #[test]
    fn duplicate_create_is_rejected_and_nothing_partially_applied() {
        let dir = tempdir().unwrap();
        let partition = open_partition(dir.path());
        partition
            .commit(
                DbId(1),
                TxId(1),
                vec![WriteOp::Create {
                    collection: "c".into(),
                    doc_id: 1,
                    payload: b"{}".to_vec(),
                }],
            )
            .unwrap();
        let err = partition
            .commit(
                DbId(1),
                TxId(2),
                vec![WriteOp::Create {
                    collection: "c".into(),
                    doc_id: 1,
                    payload: b"{}".to_vec(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[test]
    fn multi_op_transaction_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let partition = open_partition(dir.path());
        let err = partition
            .commit(
                DbId(1),
                TxId(1),
                vec![
                    WriteOp::Create {
                        collection: "c".into(),
                        doc_id: 1,
                        payload: b"{}".to_vec(),
                    },
                    WriteOp::Delete {
                        collection: "c".into(),
                        doc_id: 99, // does not exist: whole transaction must fail
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
        assert!(partition.read("c", 1, TxId::MAX).unwrap().is_none());
    }

    #[test]
    fn prepared_write_survives_until_applied() {
        let dir = tempdir().unwrap();
        let partition = open_partition(dir.path());
        let prepared = partition
            .prepare(
                DbId(1),
                TxId(1),
                vec![WriteOp::Create {
                    collection: "c".into(),
                    doc_id: 1,
                    payload: b"{}".to_vec(),
                }],
            )
            .unwrap();
        // Not yet visible: only op records were written, no Commit.
        assert!(partition.read("c", 1, TxId::MAX).unwrap().is_none());
        prepared.apply().unwrap();
        assert!(partition.read("c", 1, TxId::MAX).unwrap().is_some());
    }

    #[test]
    fn aborted_prepare_leaves_document_absent() {
        let dir = tempdir().unwrap();
        let partition = open_partition(dir.path());
        let prepared = partition
            .prepare(
                DbId(1),
                TxId(1),
                vec![WriteOp::Create {
                    collection: "c".into(),
                    doc_id: 1,
                    payload: b"{}".to_vec(),
                }],
            )
            .unwrap();
        prepared.abort();
        assert!(partition.read("c", 1, TxId::MAX).unwrap().is_none());
        // The partition must still accept new writes after an abort.
        partition
            .commit(
                DbId(1),
                TxId(2),
                vec![WriteOp::Create {
                    collection: "c".into(),
                    doc_id: 1,
                    payload: b"{}".to_vec(),
                }],
            )
            .unwrap();
        assert!(partition.read("c", 1, TxId::MAX).unwrap().is_some());
    }
}
