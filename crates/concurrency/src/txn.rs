//! Transaction handle (§4.6).
//!
//! A short-lived snapshot-isolated transaction: it sees the database as of
//! `snapshot`, and accumulates a read-set and write-set as it goes so the
//! commit path can run the SSI-lite conflict check. There is no long-running
//! transaction support — a `Transaction` is meant to live for one request.

use docdb_core::ids::TxId;
use docdb_storage::DocKey;
use std::collections::HashSet;

/// An in-flight transaction.
#[derive(Debug)]
pub struct Transaction {
    pub tx_id: TxId,
    /// The highest committed `tx_id` visible to this transaction's reads.
    pub snapshot: TxId,
    pub read_set: HashSet<DocKey>,
    pub write_set: HashSet<DocKey>,
}

impl Transaction {
    pub(crate) fn new(tx_id: TxId, snapshot: TxId) -> Self {
        Transaction {
            tx_id,
            snapshot,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
        }
    }

    /// Record that this transaction observed `(collection, doc_id)`.
    pub fn record_read(&mut self, collection: &str, doc_id: u64) {
        self.read_set.insert(DocKey {
            collection: collection.to_string(),
            doc_id,
        });
    }

    /// Record that this transaction wrote `(collection, doc_id)`.
    pub fn record_write(&mut self, collection: &str, doc_id: u64) {
        self.write_set.insert(DocKey {
            collection: collection.to_string(),
            doc_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_write_sets_track_distinct_keys() {
        let mut txn = Transaction::new(TxId(5), TxId(4));
        txn.record_read("c", 1);
        txn.record_write("c", 1);
        txn.record_write("c", 2);
        assert_eq!(txn.read_set.len(), 1);
        assert_eq!(txn.write_set.len(), 2);
    }
}
