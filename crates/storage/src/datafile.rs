//! Append-only data file (§4.2).
//!
//! Record layout on disk: `[4 payload_len][payload][4 payload_crc][1 verified_flag]`.
//! The verified flag is written last and in its own `write`/`sync` step, so a
//! record that is only partially written is never visible to a reader: the
//! reader requires both a CRC match *and* a set flag (I2, I6).
//!
//! The offset of a record is defined as the file position of its length
//! prefix — this is the value stored in the index and the value compaction
//! must remap.
//!
//! Every method here takes `&self` and uses positioned reads/writes
//! (`pread`/`pwrite`) instead of seek-then-read/write, so the type is
//! `Arc`-shareable: readers never take a lock, and the single writer a
//! partition ever has needs no `&mut` borrow either. Safety of the write
//! side still depends on the caller upholding "exactly one writer per
//! partition at a time" (I1) — this type does not itself enforce mutual
//! exclusion between writers, only between writers and readers.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use docdb_core::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const LEN_SIZE: u64 = 4;
const CRC_SIZE: u64 = 4;
const FLAG_SIZE: u64 = 1;
const VERIFIED: u8 = 1;

/// An append-only blob store backing a single partition.
pub struct DataFile {
    path: PathBuf,
    file: File,
    /// Current logical end of file — the offset the next record will land
    /// at. Atomic so a reader (`&self`) and the sole writer can share this
    /// type without a lock; a reader must see either the length from before
    /// or after an append, never a torn value.
    len: AtomicU64,
}

impl DataFile {
    /// Open (creating if absent) the data file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(DataFile {
            path,
            file,
            len: AtomicU64::new(len),
        })
    }

    /// Path of the underlying file, for compaction's `.compact` sibling
    /// naming.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full write path from §4.2: append `[len|payload|crc]`, sync, append
    /// the verified flag, optionally sync again. Returns the offset of the
    /// new record's length prefix.
    pub fn append(&self, payload: &[u8], second_sync: bool) -> Result<u64> {
        let offset = self.write_unverified(payload)?;
        self.file.sync_all()?;
        self.write_verified_flag(offset)?;
        if second_sync {
            self.file.sync_all()?;
        }
        Ok(offset)
    }

    /// Append `[len|payload|crc]` without writing the verified flag or
    /// syncing. Used by recovery (§4.4 step 5a), which performs its own
    /// single sync at the end of replay rather than one per record.
    pub fn write_unverified(&self, payload: &[u8]) -> Result<u64> {
        let offset = self.len();
        let mut body = Vec::with_capacity(LEN_SIZE as usize + payload.len() + CRC_SIZE as usize);
        body.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        body.extend_from_slice(payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        body.write_u32::<LittleEndian>(hasher.finalize()).unwrap();
        self.file.write_all_at(&body, offset)?;
        // The verified flag byte is reserved in the length but not written
        // until `write_verified_flag`; advancing `len` past it here is safe
        // because `read_at` independently requires the flag to be set.
        self.len.store(
            offset + LEN_SIZE + payload.len() as u64 + CRC_SIZE + FLAG_SIZE,
            Ordering::Release,
        );
        Ok(offset)
    }

    /// Write the trailing verified-flag byte for a record previously
    /// appended via [`write_unverified`](Self::write_unverified).
    pub fn write_verified_flag(&self, offset: u64) -> Result<()> {
        let payload_len = self.peek_len(offset)?;
        let flag_pos = offset + LEN_SIZE + payload_len as u64 + CRC_SIZE;
        self.file.write_all_at(&[VERIFIED], flag_pos)?;
        Ok(())
    }

    /// Explicit fsync, used by recovery's single end-of-replay sync (§4.4
    /// step 6) and by the write path's optional second sync.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn peek_len(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; LEN_SIZE as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read and validate the record at `offset`. Requires both a CRC match
    /// and a set verified flag (I6); a record lacking either is treated as
    /// absent, never surfaced as corruption to a normal reader, because an
    /// unflagged record is by definition an in-flight or abandoned write.
    pub fn read_at(&self, offset: u64) -> Result<Option<Vec<u8>>> {
        let len = self.len();
        if offset + LEN_SIZE > len {
            return Ok(None);
        }
        let payload_len = self.peek_len(offset)? as u64;
        let record_end = offset + LEN_SIZE + payload_len + CRC_SIZE + FLAG_SIZE;
        if record_end > len {
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.file.read_exact_at(&mut payload, offset + LEN_SIZE)?;
        let mut crc_buf = [0u8; CRC_SIZE as usize];
        self.file
            .read_exact_at(&mut crc_buf, offset + LEN_SIZE + payload_len)?;
        let stored_crc = u32::from_le_bytes(crc_buf);
        let mut flag = [0u8; 1];
        self.file
            .read_exact_at(&mut flag, offset + LEN_SIZE + payload_len + CRC_SIZE)?;

        if flag[0] != VERIFIED {
            return Ok(None);
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// Truncate the file back to `new_len`, for compaction cleanup or test
    /// fault injection. Not used by the normal write/recovery path.
    pub fn truncate(&self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }
}

/// Rewrite `live` records (each `(old_offset, payload)`) into a fresh file
/// at `compact_path` using the normal record format, syncing once at the
/// end (§4.10 step 2). Returns the new offset for each input record, in
/// the same order, so the caller can remap the index before renaming.
pub fn write_compacted(
    compact_path: impl AsRef<Path>,
    live: &[(u64, Vec<u8>)],
) -> Result<Vec<u64>> {
    let file = DataFile::open(compact_path)?;
    let mut new_offsets = Vec::with_capacity(live.len());
    for (_, payload) in live {
        let offset = file.write_unverified(payload)?;
        file.write_verified_flag(offset)?;
        new_offsets.push(offset);
    }
    file.sync()?;
    Ok(new_offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("p0.data")).unwrap();
        let offset = df.append(b"hello", true).unwrap();
        assert_eq!(offset, 0);
        let got = df.read_at(offset).unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn offsets_are_stable_across_records() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("p0.data")).unwrap();
        let a = df.append(b"first", true).unwrap();
        let b = df.append(b"second-longer", true).unwrap();
        assert_eq!(df.read_at(a).unwrap().unwrap(), b"first");
        assert_eq!(df.read_at(b).unwrap().unwrap(), b"second-longer");
    }

    #[test]
    fn missing_verified_flag_is_invisible() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("p0.data")).unwrap();
        let offset = df.write_unverified(b"partial").unwrap();
        df.sync().unwrap();
        // Flag never written: record must not be readable (I2, I6, P4).
        assert_eq!(df.read_at(offset).unwrap(), None);
        df.write_verified_flag(offset).unwrap();
        assert_eq!(df.read_at(offset).unwrap().unwrap(), b"partial");
    }

    #[test]
    fn crc_mismatch_hides_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p0.data");
        {
            let df = DataFile::open(&path).unwrap();
            df.append(b"data", true).unwrap();
        }
        // Flip a byte inside the payload region directly on disk.
        {
            let f = OpenOptions::new().write(true).open(&path).unwrap();
            f.write_all_at(&[b'X'], LEN_SIZE).unwrap();
        }
        let df = DataFile::open(&path).unwrap();
        assert_eq!(df.read_at(0).unwrap(), None);
    }

    #[test]
    fn truncated_tail_is_not_readable() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("p0.data")).unwrap();
        let offset = df.append(b"hello world", true).unwrap();
        df.truncate(offset + 3).unwrap();
        assert_eq!(df.read_at(offset).unwrap(), None);
    }

    #[test]
    fn compaction_rewrite_preserves_payloads_under_new_offsets() {
        let dir = tempdir().unwrap();
        let live = vec![(0u64, b"a".to_vec()), (10u64, b"bbbb".to_vec())];
        let new_offsets = write_compacted(dir.path().join("p0.data.compact"), &live).unwrap();
        let df = DataFile::open(dir.path().join("p0.data.compact")).unwrap();
        assert_eq!(df.read_at(new_offsets[0]).unwrap().unwrap(), b"a");
        assert_eq!(df.read_at(new_offsets[1]).unwrap().unwrap(), b"bbbb");
    }
}
