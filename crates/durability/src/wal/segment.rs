//! WAL segment naming and discovery (§3 "Partition", §4.3 "Rotation").
//!
//! A partition's WAL stream is named `p<n>.wal` (active) and
//! `p<n>.wal.1`, `p<n>.wal.2`, … (rotated, oldest-first by ascending
//! sequence). Sequence numbers are monotonic across the directory and
//! never reused, even if earlier segments are later removed by retention.

use docdb_core::ids::PartitionId;
use std::fs;
use std::path::{Path, PathBuf};

/// Base file name for a partition's WAL stream, e.g. `p0.wal`.
pub fn active_name(partition_id: PartitionId) -> String {
    format!("p{}.wal", partition_id.0)
}

/// Rotated segment file name, e.g. `p0.wal.3`.
pub fn rotated_name(partition_id: PartitionId, seq: u64) -> String {
    format!("p{}.wal.{}", partition_id.0, seq)
}

/// Full path to the active segment.
pub fn active_path(dir: &Path, partition_id: PartitionId) -> PathBuf {
    dir.join(active_name(partition_id))
}

/// Full path to a rotated segment.
pub fn rotated_path(dir: &Path, partition_id: PartitionId, seq: u64) -> PathBuf {
    dir.join(rotated_name(partition_id, seq))
}

/// Enumerate rotated segment sequence numbers present on disk for this
/// partition, ascending. Recovery reads these before the active segment
/// (§4.4 step 1); rotation uses `highest + 1` for the next sequence.
pub fn discover_rotated_sequences(dir: &Path, partition_id: PartitionId) -> std::io::Result<Vec<u64>> {
    let prefix = format!("p{}.wal.", partition_id.0);
    let mut seqs = Vec::new();
    if !dir.exists() {
        return Ok(seqs);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Ok(seq) = suffix.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn discovers_and_sorts_rotated_segments() {
        let dir = tempdir().unwrap();
        for seq in [3, 1, 2] {
            std::fs::write(rotated_path(dir.path(), PartitionId(0), seq), b"x").unwrap();
        }
        // A different partition's segment must not be picked up.
        std::fs::write(rotated_path(dir.path(), PartitionId(1), 9), b"x").unwrap();
        let seqs = discover_rotated_sequences(dir.path(), PartitionId(0)).unwrap();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn empty_directory_has_no_rotated_segments() {
        let dir = tempdir().unwrap();
        let seqs = discover_rotated_sequences(dir.path(), PartitionId(0)).unwrap();
        assert!(seqs.is_empty());
    }
}
