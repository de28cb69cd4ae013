//! Sharded MVCC index (§4.5).
//!
//! Logical type: `(collection, doc_id) -> version_chain`. Implementation:
//! `S` shards, each behind its own `RwLock`; shard selection hashes
//! `doc_id` alone so that iterating a single collection still spreads
//! across shards instead of clustering on the collection's hash.
//!
//! Concurrent correctness rests on three things (kept literally from the
//! design notes): partition workers serialize all writers for a given
//! partition, so a shard never sees two concurrent publishers; `publish`
//! is a single push onto the version chain under the shard's write lock,
//! so a reader either sees the whole new version or none of it; and reads
//! only ever take the shard's read lock, so they never block on a WAL
//! fsync or a data-file append happening elsewhere.

use dashmap::DashMap;
use docdb_core::error::{Error, Result};
use docdb_core::ids::TxId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI64, Ordering};

/// A single document version. Immutable after publish except for the
/// `deleted_tx_id` store, which is a single relaxed-ordered write under the
/// shard's write lock (never raced, since the shard lock is exclusive).
#[derive(Debug, Clone)]
pub struct Version {
    pub created_tx_id: TxId,
    pub deleted_tx_id: Option<TxId>,
    pub data_offset: u64,
    pub length: u32,
}

impl Version {
    /// Visible to a reader with `snapshot` iff created at or before the
    /// snapshot and not yet deleted as of the snapshot (§3 "Document
    /// version").
    pub fn visible_at(&self, snapshot: TxId) -> bool {
        self.created_tx_id <= snapshot
            && self.deleted_tx_id.map_or(true, |d| d > snapshot)
    }
}

/// Version chain for one document. The common case (0–2 live/recently
/// superseded versions) stays inline; a long-lived hot document overflows
/// onto the heap transparently via `SmallVec`.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    /// Newest-first.
    versions: SmallVec<[Version; 2]>,
}

impl VersionChain {
    fn push_front(&mut self, v: Version) {
        self.versions.insert(0, v);
    }

    /// First version visible at `snapshot`, scanning newest to oldest.
    pub fn visible_at(&self, snapshot: TxId) -> Option<&Version> {
        self.versions.iter().find(|v| v.visible_at(snapshot))
    }

    fn visible_at_mut(&mut self, snapshot: TxId) -> Option<&mut Version> {
        self.versions.iter_mut().find(|v| v.visible_at(snapshot))
    }

    /// All versions, newest first — used by compaction to decide what
    /// survives a rewrite.
    pub fn all(&self) -> &[Version] {
        &self.versions
    }
}

/// Key identifying a document within one shard map: `(collection, doc_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: String,
    pub doc_id: u64,
}

struct Shard {
    map: RwLock<FxHashMap<DocKey, VersionChain>>,
}

/// The sharded MVCC index for one logical database.
pub struct ShardedIndex {
    shards: Vec<Shard>,
    mask: u64,
    /// Live document counts per collection, incremented/decremented inside
    /// the same shard-lock critical section as the publish that changed
    /// them, so the count is never observed out of sync with the index.
    live_counts: DashMap<String, AtomicI64>,
}

fn hash_doc_id(doc_id: u64) -> u64 {
    // A fast non-cryptographic mix (splitmix64 finalizer) so that
    // sequential ids spread across shards instead of clustering.
    let mut x = doc_id;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

impl ShardedIndex {
    /// `shard_count` must be a power of two (asserted here rather than
    /// silently rounded, so misconfiguration fails loudly at construction).
    pub fn new(shard_count: usize) -> Self {
        assert!(
            shard_count.is_power_of_two() && shard_count > 0,
            "shard_count must be a power of two, got {shard_count}"
        );
        let shards = (0..shard_count)
            .map(|_| Shard {
                map: RwLock::new(FxHashMap::default()),
            })
            .collect();
        ShardedIndex {
            shards,
            mask: (shard_count - 1) as u64,
            live_counts: DashMap::new(),
        }
    }

    fn shard_for(&self, doc_id: u64) -> &Shard {
        let idx = (hash_doc_id(doc_id) & self.mask) as usize;
        &self.shards[idx]
    }

    /// Snapshot read: first visible version for `(collection, doc_id)` at
    /// `snapshot`, or `None`.
    pub fn lookup(&self, collection: &str, doc_id: u64, snapshot: TxId) -> Option<Version> {
        let key = DocKey {
            collection: collection.to_string(),
            doc_id,
        };
        let shard = self.shard_for(doc_id);
        let map = shard.map.read();
        map.get(&key)?.visible_at(snapshot).cloned()
    }

    /// Publish a newly created version. Fails with [`Error::AlreadyExists`]
    /// if a version is already visible at `snapshot` — checked and
    /// inserted atomically under the shard write lock, closing the window
    /// between the worker's precondition check and the publish (§4.7 step
    /// 3 promises this even though the partition write lock already
    /// serializes writers for the same partition).
    pub fn publish_create(
        &self,
        collection: &str,
        doc_id: u64,
        snapshot: TxId,
        version: Version,
    ) -> Result<()> {
        let key = DocKey {
            collection: collection.to_string(),
            doc_id,
        };
        let shard = self.shard_for(doc_id);
        let mut map = shard.map.write();
        let chain = map.entry(key).or_default();
        if chain.visible_at(snapshot).is_some() {
            return Err(Error::AlreadyExists);
        }
        chain.push_front(version);
        drop(map);
        self.bump_live_count(collection, 1);
        Ok(())
    }

    /// Publish a replacement version for an update. Fails with
    /// [`Error::NotFound`] if no version is currently visible.
    pub fn publish_update(
        &self,
        collection: &str,
        doc_id: u64,
        snapshot: TxId,
        version: Version,
    ) -> Result<()> {
        let key = DocKey {
            collection: collection.to_string(),
            doc_id,
        };
        let shard = self.shard_for(doc_id);
        let mut map = shard.map.write();
        let chain = map.get_mut(&key).ok_or(Error::NotFound)?;
        if chain.visible_at(snapshot).is_none() {
            return Err(Error::NotFound);
        }
        chain.push_front(version);
        Ok(())
    }

    /// Stamp `deleted_tx_id` on the currently visible version. Fails with
    /// [`Error::NotFound`] if none is visible.
    pub fn publish_delete(
        &self,
        collection: &str,
        doc_id: u64,
        snapshot: TxId,
        deleted_tx_id: TxId,
    ) -> Result<()> {
        let key = DocKey {
            collection: collection.to_string(),
            doc_id,
        };
        let shard = self.shard_for(doc_id);
        let mut map = shard.map.write();
        let chain = map.get_mut(&key).ok_or(Error::NotFound)?;
        let version = chain.visible_at_mut(snapshot).ok_or(Error::NotFound)?;
        version.deleted_tx_id = Some(deleted_tx_id);
        drop(map);
        self.bump_live_count(collection, -1);
        Ok(())
    }

    fn bump_live_count(&self, collection: &str, delta: i64) {
        self.live_counts
            .entry(collection.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Current live-document count for a collection (§3 "Collection").
    pub fn live_count(&self, collection: &str) -> i64 {
        self.live_counts
            .get(collection)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Remap the stored offset of a document's visible version, used by
    /// compaction after rewriting the data file (§4.2, §4.10 step 3). Must
    /// be called with the partition lock held so the rename below does not
    /// race a reader picking up a half-updated offset from the old file.
    pub fn remap_offset(&self, collection: &str, doc_id: u64, created_tx_id: TxId, new_offset: u64) {
        let key = DocKey {
            collection: collection.to_string(),
            doc_id,
        };
        let shard = self.shard_for(doc_id);
        let mut map = shard.map.write();
        if let Some(chain) = map.get_mut(&key) {
            if let Some(v) = chain
                .versions
                .iter_mut()
                .find(|v| v.created_tx_id == created_tx_id)
            {
                v.data_offset = new_offset;
            }
        }
    }

    /// Iterate every live version under `snapshot`, yielding
    /// `(collection, doc_id, Version)`. No ordering is promised (§4.5).
    pub fn for_each_live<F: FnMut(&str, u64, &Version)>(&self, snapshot: TxId, mut f: F) {
        for shard in &self.shards {
            let map = shard.map.read();
            for (key, chain) in map.iter() {
                if let Some(v) = chain.visible_at(snapshot) {
                    f(&key.collection, key.doc_id, v);
                }
            }
        }
    }

    /// Total document count across every collection (sum of live counts),
    /// used by stats reporting.
    pub fn total_live_count(&self) -> i64 {
        self.live_counts
            .iter()
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(created: u64, offset: u64) -> Version {
        Version {
            created_tx_id: TxId(created),
            deleted_tx_id: None,
            data_offset: offset,
            length: 4,
        }
    }

    #[test]
    fn create_then_lookup_is_visible_at_same_or_later_snapshot() {
        let idx = ShardedIndex::new(4);
        idx.publish_create("c", 1, TxId(0), v(5, 100)).unwrap();
        assert!(idx.lookup("c", 1, TxId(4)).is_none());
        assert!(idx.lookup("c", 1, TxId(5)).is_some());
        assert!(idx.lookup("c", 1, TxId(10)).is_some());
    }

    #[test]
    fn duplicate_create_fails_already_exists() {
        let idx = ShardedIndex::new(4);
        idx.publish_create("c", 1, TxId(0), v(5, 100)).unwrap();
        let err = idx.publish_create("c", 1, TxId(5), v(6, 200)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[test]
    fn update_on_missing_document_fails_not_found() {
        let idx = ShardedIndex::new(4);
        let err = idx.publish_update("c", 1, TxId(0), v(5, 100)).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn delete_hides_from_snapshots_after_the_deleting_tx() {
        let idx = ShardedIndex::new(4);
        idx.publish_create("c", 1, TxId(0), v(5, 100)).unwrap();
        idx.publish_delete("c", 1, TxId(5), TxId(7)).unwrap();
        assert!(idx.lookup("c", 1, TxId(6)).is_some());
        assert!(idx.lookup("c", 1, TxId(7)).is_none());
        assert!(idx.lookup("c", 1, TxId(100)).is_none());
    }

    #[test]
    fn live_count_tracks_create_and_delete() {
        let idx = ShardedIndex::new(4);
        idx.publish_create("c", 1, TxId(0), v(1, 0)).unwrap();
        idx.publish_create("c", 2, TxId(0), v(2, 10)).unwrap();
        assert_eq!(idx.live_count("c"), 2);
        idx.publish_delete("c", 1, TxId(2), TxId(3)).unwrap();
        assert_eq!(idx.live_count("c"), 1);
    }

    #[test]
    fn for_each_live_respects_snapshot() {
        let idx = ShardedIndex::new(4);
        idx.publish_create("c", 1, TxId(0), v(1, 0)).unwrap();
        idx.publish_create("c", 2, TxId(0), v(5, 10)).unwrap();
        let mut seen = Vec::new();
        idx.for_each_live(TxId(1), |_, doc_id, _| seen.push(doc_id));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_shard_count() {
        ShardedIndex::new(3);
    }
}
