//! Per-partition checkpoint file (§4.4 "Checkpoints", §6 on-disk layout).
//!
//! `p<n>.chk` records the point recovery can start replay from instead of
//! the beginning of time: `{last_lsn, wal_size_at_checkpoint}`, written
//! whenever the partition's own write lock is held for a data-file growth
//! threshold crossing (never from a background thread, so a checkpoint
//! write never races the write it is describing).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use docdb_core::error::{Error, Result};
use docdb_core::ids::{Lsn, PartitionId};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const RECORD_SIZE: usize = 8 + 8 + 4; // last_lsn + wal_size_at_checkpoint + crc

/// A partition's last-known-safe replay starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_lsn: Lsn,
    pub wal_size_at_checkpoint: u64,
}

pub fn checkpoint_path(dir: &Path, partition_id: PartitionId) -> PathBuf {
    dir.join(format!("p{}.chk", partition_id.0))
}

/// Write the checkpoint file atomically: build the new content in a
/// `.tmp` sibling, sync it, then rename over the previous checkpoint so a
/// reader never observes a half-written file.
pub fn write_checkpoint(dir: &Path, partition_id: PartitionId, checkpoint: Checkpoint) -> Result<()> {
    let final_path = checkpoint_path(dir, partition_id);
    let tmp_path = dir.join(format!("p{}.chk.tmp", partition_id.0));

    let mut buf = Vec::with_capacity(RECORD_SIZE);
    buf.write_u64::<LittleEndian>(checkpoint.last_lsn.0).unwrap();
    buf.write_u64::<LittleEndian>(checkpoint.wal_size_at_checkpoint)
        .unwrap();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    buf.write_u32::<LittleEndian>(hasher.finalize()).unwrap();

    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Read the checkpoint for this partition, if one exists. A missing file
/// means "replay from the beginning"; a corrupt file is treated the same
/// way rather than failing recovery outright, since the checkpoint is only
/// ever an optimization over full replay (P8 — crash during checkpoint
/// write must not lose data, and this is the other half of that promise).
pub fn read_checkpoint(dir: &Path, partition_id: PartitionId) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(dir, partition_id);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::from(e)),
    };
    if bytes.len() != RECORD_SIZE {
        tracing::warn!(partition_id = partition_id.0, "checkpoint file has unexpected size, ignoring");
        return Ok(None);
    }
    let crc_offset = RECORD_SIZE - 4;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..crc_offset]);
    let stored_crc = u32::from_le_bytes(bytes[crc_offset..].try_into().unwrap());
    if hasher.finalize() != stored_crc {
        tracing::warn!(partition_id = partition_id.0, "checkpoint file fails CRC, ignoring");
        return Ok(None);
    }
    let mut cur = std::io::Cursor::new(&bytes[..crc_offset]);
    let last_lsn = Lsn(cur.read_u64::<LittleEndian>()?);
    let wal_size_at_checkpoint = cur.read_u64::<LittleEndian>()?;
    Ok(Some(Checkpoint {
        last_lsn,
        wal_size_at_checkpoint,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips() {
        let dir = tempdir().unwrap();
        let chk = Checkpoint {
            last_lsn: Lsn(42),
            wal_size_at_checkpoint: 1024,
        };
        write_checkpoint(dir.path(), PartitionId(0), chk).unwrap();
        let read = read_checkpoint(dir.path(), PartitionId(0)).unwrap().unwrap();
        assert_eq!(read, chk);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(read_checkpoint(dir.path(), PartitionId(0)).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_treated_as_missing() {
        let dir = tempdir().unwrap();
        let chk = Checkpoint {
            last_lsn: Lsn(1),
            wal_size_at_checkpoint: 10,
        };
        write_checkpoint(dir.path(), PartitionId(0), chk).unwrap();
        let path = checkpoint_path(dir.path(), PartitionId(0));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(read_checkpoint(dir.path(), PartitionId(0)).unwrap().is_none());
    }

    #[test]
    fn second_write_replaces_first_atomically() {
        let dir = tempdir().unwrap();
        write_checkpoint(
            dir.path(),
            PartitionId(0),
            Checkpoint { last_lsn: Lsn(1), wal_size_at_checkpoint: 1 },
        )
        .unwrap();
        write_checkpoint(
            dir.path(),
            PartitionId(0),
            Checkpoint { last_lsn: Lsn(2), wal_size_at_checkpoint: 2 },
        )
        .unwrap();
        let read = read_checkpoint(dir.path(), PartitionId(0)).unwrap().unwrap();
        assert_eq!(read.last_lsn, Lsn(2));
        assert!(!dir.path().join("p0.chk.tmp").exists());
    }
}
