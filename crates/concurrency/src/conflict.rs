//! SSI-lite conflict detection (§4.6).
//!
//! A committing transaction `T` conflicts if some already-committed `U`
//! with `U.commit_tx_id > T.snapshot` wrote anything `T` read. This is the
//! minimal slice of Serializable Snapshot Isolation the engine implements:
//! no predicate locking, no SIREAD markers — just a bounded history of
//! recent write-sets checked against the committing transaction's read-set.

use docdb_core::ids::TxId;
use docdb_storage::DocKey;
use std::collections::{HashSet, VecDeque};

/// The write-set of one committed transaction, retained long enough to
/// validate transactions whose snapshot predates it.
struct CommittedWriteSet {
    commit_tx_id: TxId,
    write_set: HashSet<DocKey>,
}

/// Bounded ring of recent committed write-sets, shared across a database's
/// transactions.
pub struct CommitHistory {
    entries: VecDeque<CommittedWriteSet>,
    capacity: usize,
}

impl CommitHistory {
    pub fn new(capacity: usize) -> Self {
        CommitHistory {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// `true` if `read_set` intersects the write-set of any transaction
    /// committed after `snapshot`.
    pub fn conflicts_with(&self, snapshot: TxId, read_set: &HashSet<DocKey>) -> bool {
        self.entries
            .iter()
            .filter(|e| e.commit_tx_id > snapshot)
            .any(|e| !e.write_set.is_disjoint(read_set))
    }

    /// Record a newly committed transaction's write-set, evicting the
    /// oldest entry if at capacity. Entries are appended in commit order,
    /// so eviction always drops the one least likely to still matter (no
    /// transaction with a newer snapshot than every retained entry can
    /// still need it).
    pub fn record(&mut self, commit_tx_id: TxId, write_set: HashSet<DocKey>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CommittedWriteSet {
            commit_tx_id,
            write_set,
        });
    }
}
