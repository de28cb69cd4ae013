//! Fsync strategies (§4.3 "Fsync modes").

/// Controls when the WAL writer calls `fsync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncMode {
    /// Sync after every record. Maximum durability, highest latency.
    Always,
    /// Buffer up to `batch_size` records or `interval_ms` milliseconds,
    /// whichever comes first, then one sync for the whole batch. The
    /// production default.
    Group {
        batch_size: usize,
        interval_ms: u64,
    },
    /// Sync on a fixed timer regardless of write volume.
    Interval { interval_ms: u64 },
    /// Never sync. Benchmark only — a crash loses everything since the
    /// last OS-level flush, which may never happen.
    None,
}

impl FsyncMode {
    /// The production default (§9): Group commit.
    pub fn production_default() -> Self {
        FsyncMode::Group {
            batch_size: 64,
            interval_ms: 5,
        }
    }

    /// `true` if a caller must wait for a real `fsync` before being told
    /// its write is durable.
    pub fn requires_durability_wait(&self) -> bool {
        !matches!(self, FsyncMode::None)
    }
}

impl Default for FsyncMode {
    fn default() -> Self {
        Self::production_default()
    }
}
