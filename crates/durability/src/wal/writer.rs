//! The per-partition WAL writer (§4.3).
//!
//! Writers are serialized by the partition's write lock one level up — this
//! type assumes it is never called concurrently — but the fsync itself can
//! still be batched across several serialized callers: `Group` mode lets the
//! first `batch_size` callers (or whichever arrive within `interval_ms`)
//! share one `fsync`, which is where the concurrency actually comes from. A
//! background timer thread drives the periodic tick; callers either take a
//! fast path (batch threshold just reached) or block on a condvar until the
//! tick catches up to their LSN.

use docdb_core::error::{Error, Result};
use docdb_core::ids::{Lsn, PartitionId};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::record::WalRecord;
use crate::wal::mode::FsyncMode;
use crate::wal::segment;

struct SyncState {
    /// Highest LSN known to be fsync'd to disk.
    durable_lsn: Lsn,
    /// Records written (but not yet necessarily synced) since the last sync.
    writes_since_sync: usize,
    shutdown: bool,
}

struct SyncShared {
    state: Mutex<SyncState>,
    cv: Condvar,
    /// Highest LSN handed to `write_all` so far, regardless of sync state.
    /// Lock-free so the background thread can snapshot it without taking
    /// the writer's own state lock.
    appended_lsn: AtomicU64,
}

/// Writes WAL records for one partition, handling rotation and fsync batching.
pub struct WalWriter {
    dir: PathBuf,
    partition_id: PartitionId,
    file: File,
    len: u64,
    last_lsn: Lsn,
    next_rotation_seq: u64,
    max_segment_size: u64,
    mode: FsyncMode,
    shared: Arc<SyncShared>,
    bg_thread: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Open (or create) the active segment for `partition_id` under `dir`.
    /// `starting_lsn` is the last LSN recovery observed for this partition
    /// (`Lsn::NONE` for a brand new partition); the next `append` must carry
    /// exactly `starting_lsn.next()`.
    pub fn open(
        dir: PathBuf,
        partition_id: PartitionId,
        starting_lsn: Lsn,
        max_segment_size: u64,
        mode: FsyncMode,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let active_path = segment::active_path(&dir, partition_id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&active_path)?;
        let len = file.metadata()?.len();
        let next_rotation_seq = segment::discover_rotated_sequences(&dir, partition_id)?
            .into_iter()
            .max()
            .map_or(1, |s| s + 1);

        let shared = Arc::new(SyncShared {
            state: Mutex::new(SyncState {
                durable_lsn: starting_lsn,
                writes_since_sync: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            appended_lsn: AtomicU64::new(starting_lsn.0),
        });

        let bg_thread = match mode {
            FsyncMode::Group { interval_ms, .. } | FsyncMode::Interval { interval_ms } => {
                let bg_file = file.try_clone()?;
                let bg_shared = Arc::clone(&shared);
                Some(std::thread::spawn(move || {
                    background_sync_loop(bg_file, bg_shared, interval_ms)
                }))
            }
            FsyncMode::Always | FsyncMode::None => None,
        };

        Ok(WalWriter {
            dir,
            partition_id,
            file,
            len,
            last_lsn: starting_lsn,
            next_rotation_seq,
            max_segment_size,
            mode,
            shared,
            bg_thread,
        })
    }

    /// Append one record, rotating the segment first if it has crossed the
    /// size threshold, then applying this writer's fsync mode.
    ///
    /// `record.lsn` must be exactly `self.last_lsn.next()` — a caller that
    /// skips or reorders LSNs indicates a bug in the allocator one level up,
    /// not a recoverable condition.
    pub fn append(&mut self, record: &WalRecord) -> Result<Lsn> {
        assert_eq!(
            record.lsn,
            self.last_lsn.next(),
            "WAL LSN must be strictly sequential"
        );

        if self.len >= self.max_segment_size {
            self.rotate()?;
        }

        let buf = record.encode();
        self.file.write_all(&buf)?;
        self.len += buf.len() as u64;
        self.last_lsn = record.lsn;
        self.shared.appended_lsn.store(record.lsn.0, Ordering::Release);

        match self.mode {
            FsyncMode::Always => {
                self.file.sync_all()?;
                self.bump_durable(record.lsn);
            }
            FsyncMode::None => {}
            FsyncMode::Group { batch_size, .. } => {
                let reached = {
                    let mut state = self.shared.state.lock().unwrap();
                    state.writes_since_sync += 1;
                    state.writes_since_sync >= batch_size
                };
                if reached {
                    self.file.sync_all()?;
                    self.bump_durable(record.lsn);
                } else {
                    self.wait_until_durable(record.lsn);
                }
            }
            FsyncMode::Interval { .. } => {
                self.wait_until_durable(record.lsn);
            }
        }

        tracing::trace!(
            partition_id = self.partition_id.0,
            lsn = record.lsn.0,
            "wal record appended"
        );
        Ok(record.lsn)
    }

    fn bump_durable(&self, lsn: Lsn) {
        let mut state = self.shared.state.lock().unwrap();
        if lsn > state.durable_lsn {
            state.durable_lsn = lsn;
        }
        state.writes_since_sync = 0;
        self.shared.cv.notify_all();
    }

    fn wait_until_durable(&self, lsn: Lsn) {
        let mut state = self.shared.state.lock().unwrap();
        while state.durable_lsn < lsn && !state.shutdown {
            state = self.shared.cv.wait(state).unwrap();
        }
    }

    /// Sync and close the active file, rename it to the next rotated
    /// sequence, and open a fresh active file. Run *before* writing the
    /// record that would have overflowed the old segment, so a failed
    /// rotation leaves the old segment untouched and no record lost.
    fn rotate(&mut self) -> Result<()> {
        self.file.sync_all()?;
        let active_path = segment::active_path(&self.dir, self.partition_id);
        let rotated_path = segment::rotated_path(&self.dir, self.partition_id, self.next_rotation_seq);
        std::fs::rename(&active_path, &rotated_path)?;

        let fresh = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&active_path)?;
        self.file = fresh;
        self.len = 0;
        self.next_rotation_seq += 1;
        tracing::info!(
            partition_id = self.partition_id.0,
            rotated_to = %rotated_path.display(),
            "wal segment rotated"
        );
        Ok(())
    }

    /// Highest LSN fsync'd to disk, for callers that want to report
    /// durability progress without waiting on it.
    pub fn durable_lsn(&self) -> Lsn {
        self.shared.state.lock().unwrap().durable_lsn
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.bg_thread.take() {
            let _ = handle.join();
        }
    }
}

fn background_sync_loop(file: File, shared: Arc<SyncShared>, interval_ms: u64) {
    let interval = Duration::from_millis(interval_ms.max(1));
    loop {
        {
            let state = shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            let (_state, timeout) = shared
                .cv
                .wait_timeout(state, interval)
                .unwrap();
            if timeout.timed_out() {
                // Fall through and sync below.
            }
        }
        {
            let state = shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
        }
        if file.sync_all().is_err() {
            // The writer surfaces I/O failures on its own next call; the
            // background thread just keeps trying on the next tick.
            continue;
        }
        let appended = shared.appended_lsn.load(Ordering::Acquire);
        let mut state = shared.state.lock().unwrap();
        if appended > state.durable_lsn.0 {
            state.durable_lsn = Lsn(appended);
        }
        state.writes_since_sync = 0;
        shared.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_core::ids::{DbId, DocId, TxId};
    use docdb_core::op::OpType;
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
    fn always_mode_durable_lsn_advances_synchronously() {
        let dir = tempdir().unwrap();
        let mut w = WalWriter::open(
            dir.path().to_path_buf(),
            PartitionId(0),
            Lsn::NONE,
            1024 * 1024,
            FsyncMode::Always,
        )
        .unwrap();
        w.append(&rec(1)).unwrap();
        assert_eq!(w.durable_lsn(), Lsn(1));
    }

    #[test]
    fn none_mode_never_blocks_and_never_reports_durable() {
        let dir = tempdir().unwrap();
        let mut w = WalWriter::open(
            dir.path().to_path_buf(),
            PartitionId(0),
            Lsn::NONE,
            1024 * 1024,
            FsyncMode::None,
        )
        .unwrap();
        w.append(&rec(1)).unwrap();
        assert_eq!(w.durable_lsn(), Lsn::NONE);
    }

    #[test]
    fn group_mode_fast_path_syncs_at_batch_size() {
        let dir = tempdir().unwrap();
        let mut w = WalWriter::open(
            dir.path().to_path_buf(),
            PartitionId(0),
            Lsn::NONE,
            1024 * 1024,
            FsyncMode::Group {
                batch_size: 1,
                interval_ms: 10_000,
            },
        )
        .unwrap();
        // batch_size of 1 means every append takes the fast path, so this
        // returns immediately without waiting on the background timer.
        w.append(&rec(1)).unwrap();
        assert_eq!(w.durable_lsn(), Lsn(1));
    }

    #[test]
    fn interval_mode_becomes_durable_once_the_timer_ticks() {
        let dir = tempdir().unwrap();
        let mut w = WalWriter::open(
            dir.path().to_path_buf(),
            PartitionId(0),
            Lsn::NONE,
            1024 * 1024,
            FsyncMode::Interval { interval_ms: 20 },
        )
        .unwrap();
        // Blocks until the background thread's next tick, well under the
        // test harness's default timeout.
        w.append(&rec(1)).unwrap();
        assert_eq!(w.durable_lsn(), Lsn(1));
    }

    #[test]
    fn rotation_produces_new_active_segment_and_keeps_old_one() {
        let dir = tempdir().unwrap();
        let mut w = WalWriter::open(
            dir.path().to_path_buf(),
            PartitionId(0),
            Lsn::NONE,
            1, // rotate on every append after the first
            FsyncMode::Always,
        )
        .unwrap();
        w.append(&rec(1)).unwrap();
        w.append(&rec(2)).unwrap();
        let rotated = segment::discover_rotated_sequences(dir.path(), PartitionId(0)).unwrap();
        assert_eq!(rotated, vec![1]);
        assert!(segment::active_path(dir.path(), PartitionId(0)).exists());
    }

    #[test]
    #[should_panic(expected = "sequential")]
    fn out_of_order_lsn_panics() {
        let dir = tempdir().unwrap();
        let mut w = WalWriter::open(
            dir.path().to_path_buf(),
            PartitionId(0),
            Lsn::NONE,
            1024 * 1024,
            FsyncMode::Always,
        )
        .unwrap();
        w.append(&rec(5)).unwrap();
    }
}
