//! Per-database transaction manager (§4.6).

use crate::conflict::CommitHistory;
use crate::txn::Transaction;
use docdb_core::error::{Error, Result};
use docdb_core::ids::TxId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// How many recent committed write-sets the SSI-lite check retains.
const DEFAULT_COMMIT_HISTORY_CAPACITY: usize = 1024;

/// Owns one database's `tx_id` allocator, the current commit watermark, and
/// the SSI-lite commit history. One instance per open logical database.
pub struct TransactionManager {
    next_tx_id: AtomicU64,
    max_committed_tx_id: AtomicU64,
    history: Mutex<CommitHistory>,
}

impl TransactionManager {
    /// Build a manager resuming after recovery observed `max_tx_id` as the
    /// highest transaction id anywhere in the WAL (committed or not). The
    /// allocator must never hand out an id that could collide with one
    /// recovery already saw.
    pub fn recovered(max_tx_id: TxId) -> Self {
        TransactionManager {
            next_tx_id: AtomicU64::new(max_tx_id.0 + 1),
            max_committed_tx_id: AtomicU64::new(max_tx_id.0),
            history: Mutex::new(CommitHistory::new(DEFAULT_COMMIT_HISTORY_CAPACITY)),
        }
    }

    /// A fresh database with no prior history.
    pub fn fresh() -> Self {
        Self::recovered(TxId::ZERO)
    }

    /// Begin a new transaction: snapshot is the current commit watermark,
    /// so the transaction sees every effect committed strictly before it
    /// began.
    pub fn begin(&self) -> Transaction {
        let snapshot = TxId(self.max_committed_tx_id.load(Ordering::Acquire));
        Transaction::new(TxId(0), snapshot)
    }

    /// Allocate the `tx_id` this transaction will commit under. Separate
    /// from `begin` because the id is only assigned once the worker is
    /// ready to write WAL records (§4.7 step 5) — allocating it at `begin`
    /// would burn ids on transactions that never reach commit.
    pub fn allocate_tx_id(&self) -> TxId {
        TxId(self.next_tx_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Validate `txn` against the SSI-lite commit history. Must be called
    /// — and must succeed — before any of `txn`'s writes are made durable
    /// or visible: a `SerializationFailure` here is only useful as long as
    /// nothing has been persisted yet for it to contradict.
    pub fn validate(&self, tx_id: TxId, txn: &Transaction) -> Result<()> {
        let history = self.history.lock();
        if history.conflicts_with(txn.snapshot, &txn.read_set) {
            return Err(Error::SerializationFailure(format!(
                "transaction {} conflicts with a write committed after its snapshot",
                tx_id
            )));
        }
        Ok(())
    }

    /// Record `txn`'s write-set and advance the commit watermark. Call
    /// only after `validate` has succeeded for the same transaction and
    /// its effects are already durable and published.
    pub fn record_commit(&self, tx_id: TxId, txn: &Transaction) {
        let mut history = self.history.lock();
        history.record(tx_id, txn.write_set.clone());
        self.max_committed_tx_id.fetch_max(tx_id.0, Ordering::AcqRel);
    }

    /// Highest transaction id committed so far.
    pub fn max_committed_tx_id(&self) -> TxId {
        TxId(self.max_committed_tx_id.load(Ordering::Acquire))
    }
}
