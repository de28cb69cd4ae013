//! Partition-open recovery (§4.4).
//!
//! Replays a partition's WAL segments against its data file and index,
//! reconstructing exactly the state a clean shutdown would have left:
//! buffer records by `tx_id`, apply a transaction's buffered ops only when
//! its `Commit` record is seen, and discard anything never committed.
//! Checkpoint-bounded: records already reflected by the last checkpoint are
//! skipped rather than re-applied, which is what keeps replay time bounded
//! by "time since last checkpoint" instead of "time since partition birth".

use crate::checkpoint::read_checkpoint;
use crate::record::WalRecord;
use crate::wal::reader::{ReadOutcome, WalSegmentReader};
use crate::wal::segment;
use docdb_core::error::Result;
use docdb_core::ids::{Lsn, PartitionId, TxId};
use docdb_core::op::OpType;
use docdb_storage::{DataFile, ShardedIndex, Version};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What recovery learned about a partition, handed to the writer and the
/// transaction manager so both resume exactly where the crash left off.
#[derive(Debug, Clone, Copy)]
pub struct RecoveredPartition {
    /// Highest LSN observed anywhere in the WAL (committed or not). The
    /// writer's next append must carry `last_lsn.next()`.
    pub last_lsn: Lsn,
    /// Highest `tx_id` observed anywhere in the WAL. The transaction
    /// manager's allocator resumes from `max_tx_id.next()`.
    pub max_tx_id: TxId,
}

struct PendingTx {
    records: Vec<WalRecord>,
}

/// Recover one partition: read its segments in order, apply committed
/// transactions into `index` and `datafile`, and report the replay
/// high-water marks.
pub fn recover_partition(
    dir: &Path,
    partition_id: PartitionId,
    datafile: &mut DataFile,
    index: &ShardedIndex,
) -> Result<RecoveredPartition> {
    let checkpoint = read_checkpoint(dir, partition_id)?;
    let mut last_lsn = checkpoint.map(|c| c.last_lsn).unwrap_or(Lsn::NONE);
    let mut max_tx_id = TxId::ZERO;
    let mut pending: HashMap<TxId, PendingTx> = HashMap::new();

    let rotated = segment::discover_rotated_sequences(dir, partition_id)?;
    let mut segments: Vec<(PathBuf, bool)> = rotated
        .into_iter()
        .map(|seq| (segment::rotated_path(dir, partition_id, seq), false))
        .collect();
    segments.push((segment::active_path(dir, partition_id), true));

    'segments: for (path, is_active) in segments {
        if !path.exists() {
            continue;
        }
        let mut reader = match WalSegmentReader::open(&path) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(partition_id = partition_id.0, path = %path.display(), error = %e, "failed to open wal segment, skipping");
                continue;
            }
        };
        loop {
            let before = reader.offset();
            match reader.next_record() {
                Ok(ReadOutcome::Record(record)) => {
                    if record.lsn > last_lsn {
                        last_lsn = record.lsn;
                    }
                    if record.tx_id > max_tx_id {
                        max_tx_id = record.tx_id;
                    }
                    let already_applied = checkpoint
                        .map(|c| record.lsn <= c.last_lsn)
                        .unwrap_or(false);
                    if already_applied {
                        continue;
                    }
                    match record.op_type {
                        OpType::Commit => {
                            if let Some(tx) = pending.remove(&record.tx_id) {
                                apply_committed(datafile, index, record.tx_id, tx.records)?;
                            }
                        }
                        OpType::Checkpoint => {
                            // In-stream checkpoint markers are informational only;
                            // the authoritative checkpoint lives in the `.chk` file.
                        }
                        OpType::Create | OpType::Update | OpType::Delete => {
                            pending
                                .entry(record.tx_id)
                                .or_insert_with(|| PendingTx { records: Vec::new() })
                                .records
                                .push(record);
                        }
                    }
                }
                Ok(ReadOutcome::TornTail) => {
                    if is_active {
                        truncate_active_segment(&path, before)?;
                    } else if before > 0 {
                        tracing::warn!(
                            partition_id = partition_id.0,
                            path = %path.display(),
                            offset = before,
                            "non-active wal segment ends in a torn tail, treating remainder as terminated"
                        );
                    }
                    continue 'segments;
                }
                Err(e) => {
                    if is_active {
                        tracing::warn!(partition_id = partition_id.0, offset = before, error = %e, "corrupt record in active wal segment, truncating tail");
                        truncate_active_segment(&path, before)?;
                    } else {
                        tracing::warn!(partition_id = partition_id.0, path = %path.display(), offset = before, error = %e, "corrupt record in frozen wal segment, treating remainder as terminated");
                    }
                    continue 'segments;
                }
            }
        }
    }

    // Anything still pending here had op records but no matching Commit:
    // discarded per the atomicity rule (§4.4 step 7) by simply never applying.
    datafile.sync()?;

    Ok(RecoveredPartition { last_lsn, max_tx_id })
}

fn apply_committed(
    datafile: &mut DataFile,
    index: &ShardedIndex,
    tx_id: TxId,
    records: Vec<WalRecord>,
) -> Result<()> {
    for record in records {
        match record.op_type {
            OpType::Create => {
                let offset = datafile.write_unverified(&record.payload)?;
                datafile.write_verified_flag(offset)?;
                let version = Version {
                    created_tx_id: tx_id,
                    deleted_tx_id: None,
                    data_offset: offset,
                    length: record.payload.len() as u32,
                };
                // A duplicate-create on replay would indicate index
                // corruption upstream of the WAL, not a normal outcome; log
                // and move on rather than aborting the whole recovery.
                if let Err(e) =
                    index.publish_create(&record.collection, record.doc_id.0, tx_id, version)
                {
                    tracing::warn!(doc_id = record.doc_id.0, error = %e, "replay of create could not publish");
                }
            }
            OpType::Update => {
                let offset = datafile.write_unverified(&record.payload)?;
                datafile.write_verified_flag(offset)?;
                let version = Version {
                    created_tx_id: tx_id,
                    deleted_tx_id: None,
                    data_offset: offset,
                    length: record.payload.len() as u32,
                };
                if let Err(e) =
                    index.publish_update(&record.collection, record.doc_id.0, tx_id, version)
                {
                    tracing::warn!(doc_id = record.doc_id.0, error = %e, "replay of update could not publish");
                }
            }
            OpType::Delete => {
                if let Err(e) =
                    index.publish_delete(&record.collection, record.doc_id.0, tx_id, tx_id)
                {
                    tracing::warn!(doc_id = record.doc_id.0, error = %e, "replay of delete could not publish");
                }
            }
            OpType::Commit | OpType::Checkpoint => unreachable!("non-document op buffered"),
        }
    }
    Ok(())
}

fn truncate_active_segment(path: &Path, offset: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    file.sync_all()?;
    Ok(())
}
