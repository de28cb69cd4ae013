//! Sequential WAL segment reader (§4.4 "Recovery").
//!
//! A segment is a flat sequence of length-prefixed records with no
//! separator between them — the reader advances by trusting the `len`
//! field, then validating the record it names. Two distinct failure modes
//! matter to the caller: a `len` field with no plausible record behind it
//! (the torn tail of an in-progress write, expected only at the end of the
//! active segment) versus a record whose `len` looks plausible but whose
//! CRC fails (genuine corruption, never expected on a non-active segment).

use crate::record::{WalRecord, MIN_RECORD_SIZE};
use byteorder::{LittleEndian, ReadBytesExt};
use docdb_core::error::{Error, Result};
use docdb_core::limits::MAX_PAYLOAD_SIZE;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Upper bound on a record's total on-disk size: the fixed header plus the
/// largest payload allowed, with slack for a pathologically long (but still
/// within bounds) collection name.
const MAX_PLAUSIBLE_RECORD_LEN: u64 = MIN_RECORD_SIZE as u64 + MAX_PAYLOAD_SIZE as u64 + 256;

/// Outcome of reading one record from a segment.
pub enum ReadOutcome {
    /// A well-formed, CRC-valid record.
    Record(WalRecord),
    /// The segment ends here: either truly empty remainder, or a `len`
    /// field whose claimed size runs past EOF — the torn tail of a write
    /// that never finished. Not an error; recovery truncates here on the
    /// active segment and simply stops on any other segment.
    TornTail,
}

/// Reads WAL records sequentially from one segment file.
pub struct WalSegmentReader {
    reader: BufReader<File>,
    /// Byte offset of the next record to read, for torn-tail truncation.
    offset: u64,
}

impl WalSegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(WalSegmentReader {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Current read offset — the byte position recovery should truncate the
    /// active segment to if the next read is a torn tail.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record, or report that the segment ends here.
    ///
    /// A `len` field is read first; if fewer than 8 bytes remain, or the
    /// claimed length is outside `[MIN_RECORD_SIZE, MAX_PLAUSIBLE_RECORD_LEN]`,
    /// or the claimed length runs past EOF, this is a torn tail rather than
    /// an error — genuine mid-segment corruption still decodes a plausible
    /// length and fails on CRC instead, which `WalRecord::decode` reports as
    /// `Error::CRCMismatch`/`Error::CorruptRecord` for the caller to handle
    /// per-segment (torn-tail tolerant only on the active segment).
    pub fn next_record(&mut self) -> Result<ReadOutcome> {
        let start_offset = self.offset;
        let mut len_buf = [0u8; 8];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(ReadOutcome::TornTail)
            }
            Err(e) => return Err(Error::from(e)),
        }
        let body_len = u64::from_le_bytes(len_buf);
        if !(MIN_RECORD_SIZE as u64 - 8..=MAX_PLAUSIBLE_RECORD_LEN).contains(&body_len) {
            return Ok(ReadOutcome::TornTail);
        }

        let mut body = vec![0u8; body_len as usize];
        match self.reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(ReadOutcome::TornTail)
            }
            Err(e) => return Err(Error::from(e)),
        }

        let mut full = Vec::with_capacity(8 + body.len());
        full.extend_from_slice(&len_buf);
        full.extend_from_slice(&body);
        self.offset = start_offset + full.len() as u64;

        match WalRecord::decode(&full) {
            Ok(record) => Ok(ReadOutcome::Record(record)),
            Err(e) => Err(e),
        }
    }
}

/// Read every record one-shot-decodable as valid out of a segment, up to
/// (and not including) the first failure. Returns the records plus the
/// offset to resume/truncate at and whether that stopping point was a torn
/// tail (as opposed to a hard decode error, which is returned instead).
pub fn read_segment_tolerant(path: impl AsRef<Path>) -> Result<(Vec<WalRecord>, u64, bool)> {
    let mut reader = WalSegmentReader::open(path)?;
    let mut records = Vec::new();
    loop {
        let before = reader.offset();
        match reader.next_record() {
            Ok(ReadOutcome::Record(r)) => records.push(r),
            Ok(ReadOutcome::TornTail) => return Ok((records, before, true)),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalRecord;
    use docdb_core::ids::{DbId, DocId, Lsn, TxId};
    use docdb_core::op::OpType;
    use std::io::Write;
    use tempfile::tempdir;

    fn rec(lsn: u64) -> WalRecord {
        WalRecord::new(
            Lsn(lsn),
            TxId(1),
            DbId(1),
            "c",
            OpType::Create,
            DocId(lsn),
            b"{}".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn reads_all_well_formed_records_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p0.wal");
        {
            let mut f = File::create(&path).unwrap();
            for i in 1..=3 {
                f.write_all(&rec(i).encode()).unwrap();
            }
        }
        let (records, offset, torn) = read_segment_tolerant(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, Lsn(1));
        assert_eq!(records[2].lsn, Lsn(3));
        assert!(torn); // ends cleanly at EOF, which reads as an empty torn tail
        assert_eq!(offset, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn truncated_final_record_reports_as_torn_tail_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p0.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&rec(1).encode()).unwrap();
            let partial = rec(2).encode();
            f.write_all(&partial[..partial.len() / 2]).unwrap();
        }
        let (records, offset, torn) = read_segment_tolerant(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(torn);
        assert_eq!(offset, rec(1).encode().len() as u64);
    }

    #[test]
    fn mid_segment_crc_corruption_is_a_hard_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p0.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&rec(1).encode()).unwrap();
            let mut corrupt = rec(2).encode();
            let mid = corrupt.len() / 2;
            corrupt[mid] ^= 0xFF;
            f.write_all(&corrupt).unwrap();
        }
        let err = read_segment_tolerant(&path).unwrap_err();
        assert!(matches!(err, Error::CRCMismatch(_)));
    }

    #[test]
    fn empty_segment_is_an_empty_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p0.wal");
        File::create(&path).unwrap();
        let (records, offset, torn) = read_segment_tolerant(&path).unwrap();
        assert!(records.is_empty());
        assert!(torn);
        assert_eq!(offset, 0);
    }
}
