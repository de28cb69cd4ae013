//! WAL record codec (§4.1, §6): the v4 layout is the only version this
//! engine writes. Decode still auto-detects by minimum size the way the
//! original implementation's multi-version codec did, so that a record too
//! short to contain even the fixed-size v4 header is reported as
//! `CorruptRecord` rather than panicking on an out-of-bounds slice.
//!
//! On-disk layout, little-endian throughout:
//!
//! ```text
//! [8 len][8 lsn][8 tx_id][8 db_id][2 coll_len][coll_bytes]
//! [1 op_type][8 doc_id][4 payload_len][4 payload_crc][payload][4 record_crc]
//! ```
//!
//! `len` is the byte count *following* the `len` field itself (standard
//! length-prefixed framing). `record_crc` covers every byte of the record
//! from the start of `len` through the end of `payload` — everything
//! except itself. `payload_crc` covers the payload alone, so a corrupted
//! payload can be distinguished from a corrupted header even though both
//! fail the outer `record_crc` check.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use docdb_core::error::{Error, Result};
use docdb_core::ids::{DbId, DocId, Lsn, TxId};
use docdb_core::limits::{normalize_collection_name, MAX_COLLECTION_NAME_LEN, MAX_PAYLOAD_SIZE};
use docdb_core::op::OpType;
use std::io::Cursor;

/// Current (and only) on-disk WAL record format version.
pub const WAL_FORMAT_VERSION: u8 = 4;

/// Bytes before the variable-length collection name and payload:
/// len(8) + lsn(8) + tx_id(8) + db_id(8) + coll_len(2) + op_type(1) +
/// doc_id(8) + payload_len(4) + payload_crc(4) + record_crc(4) = 55.
pub const MIN_RECORD_SIZE: usize = 8 + 8 + 8 + 8 + 2 + 1 + 8 + 4 + 4 + 4;

/// A decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub tx_id: TxId,
    pub db_id: DbId,
    pub collection: String,
    pub op_type: OpType,
    pub doc_id: DocId,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Build a record, normalizing the collection name per §3.
    pub fn new(
        lsn: Lsn,
        tx_id: TxId,
        db_id: DbId,
        collection: &str,
        op_type: OpType,
        doc_id: DocId,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let collection = normalize_collection_name(collection)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidPayload(format!(
                "payload of {} bytes exceeds max of {} bytes",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        Ok(WalRecord {
            lsn,
            tx_id,
            db_id,
            collection,
            op_type,
            doc_id,
            payload,
        })
    }

    /// Encode the full on-disk record, including the leading length field.
    pub fn encode(&self) -> Vec<u8> {
        let coll_bytes = self.collection.as_bytes();
        debug_assert!(coll_bytes.len() <= MAX_COLLECTION_NAME_LEN);

        let body_len = 8 // lsn
            + 8 // tx_id
            + 8 // db_id
            + 2 + coll_bytes.len() // coll_len + coll_bytes
            + 1 // op_type
            + 8 // doc_id
            + 4 + 4 // payload_len + payload_crc
            + self.payload.len();
        let len_field = (body_len + 4) as u64; // + record_crc, not counting the len field itself

        let mut buf = Vec::with_capacity(8 + body_len + 4);
        buf.write_u64::<LittleEndian>(len_field).unwrap();
        buf.write_u64::<LittleEndian>(self.lsn.0).unwrap();
        buf.write_u64::<LittleEndian>(self.tx_id.0).unwrap();
        buf.write_u64::<LittleEndian>(self.db_id.0).unwrap();
        buf.write_u16::<LittleEndian>(coll_bytes.len() as u16).unwrap();
        buf.extend_from_slice(coll_bytes);
        buf.write_u8(self.op_type.to_byte()).unwrap();
        buf.write_u64::<LittleEndian>(self.doc_id.0).unwrap();
        buf.write_u32::<LittleEndian>(self.payload.len() as u32).unwrap();

        let mut payload_hasher = crc32fast::Hasher::new();
        payload_hasher.update(&self.payload);
        buf.write_u32::<LittleEndian>(payload_hasher.finalize()).unwrap();
        buf.extend_from_slice(&self.payload);

        let mut record_hasher = crc32fast::Hasher::new();
        record_hasher.update(&buf);
        buf.write_u32::<LittleEndian>(record_hasher.finalize()).unwrap();
        buf
    }

    /// Decode a full record from `buf`, which must contain exactly one
    /// record (the caller has already framed it using the `len` prefix).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MIN_RECORD_SIZE {
            return Err(Error::CorruptRecord(format!(
                "record of {} bytes is shorter than the minimum v4 header of {} bytes",
                buf.len(),
                MIN_RECORD_SIZE
            )));
        }
        let record_crc_offset = buf.len() - 4;
        let stored_record_crc = u32::from_le_bytes(
            buf[record_crc_offset..]
                .try_into()
                .map_err(|_| Error::CorruptRecord("truncated record_crc".into()))?,
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..record_crc_offset]);
        if hasher.finalize() != stored_record_crc {
            return Err(Error::CRCMismatch("record_crc mismatch".into()));
        }

        let mut cur = Cursor::new(buf);
        let _len = cur.read_u64::<LittleEndian>()?;
        let lsn = Lsn(cur.read_u64::<LittleEndian>()?);
        let tx_id = TxId(cur.read_u64::<LittleEndian>()?);
        let db_id = DbId(cur.read_u64::<LittleEndian>()?);
        let coll_len = cur.read_u16::<LittleEndian>()? as usize;
        if coll_len > MAX_COLLECTION_NAME_LEN {
            return Err(Error::CorruptRecord(format!(
                "collection name length {coll_len} exceeds max of {MAX_COLLECTION_NAME_LEN}"
            )));
        }
        let start = cur.position() as usize;
        let end = start + coll_len;
        if end > buf.len() {
            return Err(Error::CorruptRecord("truncated collection name".into()));
        }
        let collection = String::from_utf8(buf[start..end].to_vec())
            .map_err(|e| Error::CorruptRecord(format!("collection name not utf8: {e}")))?;
        cur.set_position(end as u64);

        let op_type = OpType::from_byte(cur.read_u8()?)?;
        let doc_id = DocId(cur.read_u64::<LittleEndian>()?);
        let payload_len = cur.read_u32::<LittleEndian>()? as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            // Enforced before allocation: never `vec![0; payload_len]` first.
            return Err(Error::CorruptRecord(format!(
                "payload length {payload_len} exceeds max of {MAX_PAYLOAD_SIZE}"
            )));
        }
        let stored_payload_crc = cur.read_u32::<LittleEndian>()?;

        let payload_start = cur.position() as usize;
        let payload_end = payload_start + payload_len;
        if payload_end > record_crc_offset {
            return Err(Error::CorruptRecord("truncated payload".into()));
        }
        let payload = buf[payload_start..payload_end].to_vec();

        let mut payload_hasher = crc32fast::Hasher::new();
        payload_hasher.update(&payload);
        if payload_hasher.finalize() != stored_payload_crc {
            return Err(Error::CRCMismatch("payload_crc mismatch".into()));
        }

        Ok(WalRecord {
            lsn,
            tx_id,
            db_id,
            collection,
            op_type,
            doc_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WalRecord {
        WalRecord::new(
            Lsn(1),
            TxId(1),
            DbId(1),
            "coll",
            OpType::Create,
            DocId(7),
            br#"{"x":1}"#.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn round_trips() {
        let rec = sample();
        let buf = rec.encode();
        let decoded = WalRecord::decode(&buf).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn empty_collection_normalizes_to_default() {
        let rec = WalRecord::new(Lsn(1), TxId(1), DbId(1), "", OpType::Create, DocId(1), vec![])
            .unwrap();
        assert_eq!(rec.collection, "_default");
    }

    #[test]
    fn overlong_collection_name_rejected_at_construction() {
        let long = "x".repeat(MAX_COLLECTION_NAME_LEN + 1);
        assert!(WalRecord::new(Lsn(1), TxId(1), DbId(1), &long, OpType::Create, DocId(1), vec![])
            .is_err());
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let rec = sample();
        let mut buf = rec.encode();
        let flip_at = buf.len() / 2;
        buf[flip_at] ^= 0x01;
        let err = WalRecord::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::CRCMismatch(_)));
    }

    #[test]
    fn truncated_buffer_is_corrupt_not_panic() {
        let rec = sample();
        let buf = rec.encode();
        let truncated = &buf[..buf.len() - 5];
        let err = WalRecord::decode(truncated).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord(_)));
    }

    #[test]
    fn below_minimum_size_is_corrupt() {
        let err = WalRecord::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord(_)));
    }

    #[test]
    fn payload_corruption_is_isolated_from_header_corruption() {
        let rec = sample();
        let mut buf = rec.encode();
        // Flip a byte inside the payload only, leaving the header correct
        // relative to itself but wrong relative to record_crc.
        let payload_region_start = buf.len() - 4 - rec.payload.len();
        buf[payload_region_start] ^= 0xFF;
        let err = WalRecord::decode(&buf).unwrap_err();
        // record_crc covers the payload too, so this is caught as a
        // record-level mismatch even though it originated in the payload.
        assert!(matches!(err, Error::CRCMismatch(_)));
    }
}
