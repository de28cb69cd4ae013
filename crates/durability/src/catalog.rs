//! Database catalog (§4.9 "Logical DB / Pool", §6 on-disk layout).
//!
//! `catalog.bin` is append-only: a logical database's status changes (open,
//! then eventually deleted) are new trailing records, never rewrites of an
//! earlier one. The pool reduces the log to the latest record per `db_id`
//! on load, the same way the WAL reduces per-document records to the
//! latest version per `doc_id`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use docdb_core::error::{Error, Result};
use docdb_core::ids::DbId;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Lifecycle state of a logical database, as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    Open = 0,
    Deleted = 1,
}

impl DbStatus {
    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(DbStatus::Open),
            1 => Ok(DbStatus::Deleted),
            other => Err(Error::CorruptRecord(format!("unknown db status byte {other}"))),
        }
    }
}

/// One catalog entry: a logical database's identity, name, status, and
/// partition count as of the most recent record for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub db_id: DbId,
    pub name: String,
    pub status: DbStatus,
    pub partition_count: u16,
}

fn catalog_path(dir: &Path) -> PathBuf {
    dir.join("catalog.bin")
}

fn encode_entry(entry: &CatalogEntry) -> Vec<u8> {
    let name_bytes = entry.name.as_bytes();
    let body_len = 8 + 2 + name_bytes.len() + 1 + 2;
    let mut buf = Vec::with_capacity(4 + body_len + 4);
    buf.write_u32::<LittleEndian>(body_len as u32).unwrap();
    buf.write_u64::<LittleEndian>(entry.db_id.0).unwrap();
    buf.write_u16::<LittleEndian>(name_bytes.len() as u16).unwrap();
    buf.extend_from_slice(name_bytes);
    buf.write_u8(entry.status.to_byte()).unwrap();
    buf.write_u16::<LittleEndian>(entry.partition_count).unwrap();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    buf.write_u32::<LittleEndian>(hasher.finalize()).unwrap();
    buf
}

fn decode_entry(body: &[u8]) -> Result<CatalogEntry> {
    let mut cur = Cursor::new(body);
    let db_id = DbId(cur.read_u64::<LittleEndian>()?);
    let name_len = cur.read_u16::<LittleEndian>()? as usize;
    let start = cur.position() as usize;
    let end = start + name_len;
    if end + 1 + 2 > body.len() {
        return Err(Error::CorruptRecord("truncated catalog entry".into()));
    }
    let name = String::from_utf8(body[start..end].to_vec())
        .map_err(|e| Error::CorruptRecord(format!("catalog name not utf8: {e}")))?;
    cur.set_position(end as u64);
    let status = DbStatus::from_byte(cur.read_u8()?)?;
    let partition_count = cur.read_u16::<LittleEndian>()?;
    Ok(CatalogEntry {
        db_id,
        name,
        status,
        partition_count,
    })
}

/// Append one catalog record, fsyncing before returning so a crash never
/// leaves the catalog disagreeing with an already-acknowledged open/close.
pub fn append_entry(dir: &Path, entry: &CatalogEntry) -> Result<()> {
    let path = catalog_path(dir);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&encode_entry(entry))?;
    file.sync_all()?;
    Ok(())
}

/// Load the catalog, reducing it to the latest record per `db_id`. A
/// trailing corrupt or torn record is tolerated the same way a WAL's torn
/// tail is: everything read successfully before it still counts.
pub fn load(dir: &Path) -> Result<Vec<CatalogEntry>> {
    let path = catalog_path(dir);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from(e)),
    };

    let mut latest: HashMap<DbId, CatalogEntry> = HashMap::new();
    let mut offset = 0usize;
    while offset + 4 <= bytes.len() {
        let body_len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let record_end = offset + 4 + body_len + 4;
        if record_end > bytes.len() {
            tracing::warn!(offset, "catalog ends in a torn trailing record, ignoring remainder");
            break;
        }
        let body = &bytes[offset + 4..offset + 4 + body_len];
        let stored_crc =
            u32::from_le_bytes(bytes[offset + 4 + body_len..record_end].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            tracing::warn!(offset, "catalog record fails CRC, ignoring remainder");
            break;
        }
        let entry = decode_entry(body)?;
        latest.insert(entry.db_id, entry);
        offset = record_end;
    }

    let mut entries: Vec<_> = latest.into_values().collect();
    entries.sort_by_key(|e| e.db_id.0);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: u64, name: &str, status: DbStatus) -> CatalogEntry {
        CatalogEntry {
            db_id: DbId(id),
            name: name.to_string(),
            status,
            partition_count: 4,
        }
    }

    #[test]
    fn empty_catalog_is_empty() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn later_record_supersedes_earlier_for_same_db_id() {
        let dir = tempdir().unwrap();
        append_entry(dir.path(), &entry(1, "orders", DbStatus::Open)).unwrap();
        append_entry(dir.path(), &entry(1, "orders", DbStatus::Deleted)).unwrap();
        let entries = load(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DbStatus::Deleted);
    }

    #[test]
    fn distinct_db_ids_both_survive() {
        let dir = tempdir().unwrap();
        append_entry(dir.path(), &entry(1, "orders", DbStatus::Open)).unwrap();
        append_entry(dir.path(), &entry(2, "events", DbStatus::Open)).unwrap();
        let entries = load(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn torn_trailing_record_is_ignored() {
        let dir = tempdir().unwrap();
        append_entry(dir.path(), &entry(1, "orders", DbStatus::Open)).unwrap();
        let mut f = OpenOptions::new()
            .append(true)
            .open(catalog_path(dir.path()))
            .unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        let entries = load(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
