//! Pool mapping `db_id -> LogicalDb`, lazy open, and the fan-out scheduler
//! (§4.9 "Logical DB / Pool / Scheduler").
//!
//! The pool only owns lifecycle (catalog, lazy open/close) and dispatch;
//! all per-database execution happens in [`LogicalDb`]. Admission is bounded
//! per database, independently of the shared worker pool: a task only ever
//! reaches the single shared channel once its database's in-flight-plus-
//! queued counter has been reserved under the configured depth, so
//! `Backpressure` is returned to the caller immediately instead of a worker
//! thread blocking on a full per-DB queue.

use crate::config::EngineConfig;
use crate::database::{DbOp, LogicalDb};
use crate::memory::GlobalMemory;
use dashmap::DashMap;
use docdb_core::error::{Error, Result};
use docdb_core::ids::DbId;
use docdb_durability::catalog::{self, CatalogEntry, DbStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One unit of scheduled work: a batch of ops against an already-opened
/// database, plus a one-shot reply channel back to the submitter.
struct Task {
    db: Arc<LogicalDb>,
    ops: Vec<DbOp>,
    reply: Sender<Result<Vec<Option<Vec<u8>>>>>,
}

/// Snapshot of pool-wide state, returned by `Stats()` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open_db_count: usize,
    pub global_memory_used_bytes: u64,
    pub global_memory_cap_bytes: u64,
}

/// The shared engine instance: every open database, the worker pool that
/// runs their batches, and the catalog that survives a restart.
pub struct Pool {
    root: PathBuf,
    config: EngineConfig,
    global_memory: Arc<GlobalMemory>,
    dbs: DashMap<DbId, Arc<LogicalDb>>,
    name_index: Mutex<HashMap<String, DbId>>,
    next_db_id: AtomicU64,
    /// In-flight-plus-queued task count per database, used only for
    /// admission control — the tasks themselves all share one channel.
    queue_depth: DashMap<DbId, Arc<AtomicUsize>>,
    task_tx: Option<Sender<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Open (or create) the pool's data directory, load its catalog, and
    /// spawn the shared worker pool. No individual database is opened yet —
    /// that happens on the first `open_db`/`execute` that touches it.
    pub fn open(root: impl Into<PathBuf>, config: EngineConfig) -> Result<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let entries = catalog::load(&root)?;
        let mut name_index = HashMap::new();
        let mut max_db_id = 0u64;
        for entry in &entries {
            name_index.insert(entry.name.clone(), entry.db_id);
            max_db_id = max_db_id.max(entry.db_id.0);
        }

        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let shared_rx = Arc::new(Mutex::new(task_rx));
        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let rx = Arc::clone(&shared_rx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("docdb-worker-{worker_id}"))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn worker thread"),
            );
        }

        Ok(Arc::new(Pool {
            root,
            global_memory: Arc::new(GlobalMemory::new(config.global_memory_cap_bytes)),
            config,
            dbs: DashMap::new(),
            name_index: Mutex::new(name_index),
            next_db_id: AtomicU64::new(max_db_id + 1),
            queue_depth: DashMap::new(),
            task_tx: Some(task_tx),
            workers: Mutex::new(workers),
        }))
    }

    /// Resolve `name` to a `db_id`, creating a fresh catalog entry and
    /// physically opening the database on first use; a name seen before
    /// reopens the same `db_id`, reusing its cached `LogicalDb` if it's
    /// still resident or reopening it from disk otherwise.
    pub fn open_db(&self, name: &str) -> Result<DbId> {
        let db_id = {
            let mut name_index = self.name_index.lock();
            if let Some(existing) = name_index.get(name) {
                *existing
            } else {
                let db_id = DbId(self.next_db_id.fetch_add(1, Ordering::AcqRel));
                catalog::append_entry(
                    &self.root,
                    &CatalogEntry {
                        db_id,
                        name: name.to_string(),
                        status: DbStatus::Open,
                        partition_count: self.config.partition_count,
                    },
                )?;
                name_index.insert(name.to_string(), db_id);
                db_id
            }
        };
        self.ensure_open(db_id, name)?;
        Ok(db_id)
    }

    fn ensure_open(&self, db_id: DbId, name: &str) -> Result<()> {
        if self.dbs.contains_key(&db_id) {
            return Ok(());
        }
        let dir = self.root.join(name);
        let durability = &self.config.durability;
        let db = LogicalDb::open(
            db_id,
            &dir,
            self.config.partition_count,
            durability.wal_rotation_size_bytes,
            durability.checkpoint_interval_bytes,
            durability.resolve_fsync_mode(),
            self.config.shard_count,
            self.config.per_db_memory_cap_bytes,
            Arc::clone(&self.global_memory),
        )?;
        self.dbs.insert(db_id, Arc::new(db));
        Ok(())
    }

    /// Evict a database's in-memory state (§3 "closed on shutdown or
    /// explicit close"). The catalog entry and its name mapping survive, so
    /// a later `open_db` for the same name transparently reopens it.
    pub fn close_db(&self, db_id: DbId) -> Result<()> {
        self.dbs.remove(&db_id);
        self.queue_depth.remove(&db_id);
        Ok(())
    }

    /// Run a batch of ops against `db_id` through the scheduler: admission
    /// is checked against the configured per-DB queue depth before the task
    /// is handed to the worker pool, and this call blocks until a worker
    /// finishes it.
    pub fn execute(&self, db_id: DbId, ops: Vec<DbOp>) -> Result<Vec<Option<Vec<u8>>>> {
        let db = self.dbs.get(&db_id).map(|e| Arc::clone(e.value())).ok_or(Error::DBNotOpen)?;

        let depth = self
            .queue_depth
            .entry(db_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        reserve_slot(&depth, self.config.scheduler_queue_depth)?;

        let (reply_tx, reply_rx) = mpsc::channel();
        let task = Task { db, ops, reply: reply_tx };
        self.task_tx
            .as_ref()
            .expect("task sender only taken down by Drop")
            .send(task)
            .map_err(|_| Error::DBNotOpen)?;

        let result = reply_rx.recv().map_err(|_| Error::DBNotOpen)?;
        depth.fetch_sub(1, Ordering::AcqRel);
        result
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            open_db_count: self.dbs.len(),
            global_memory_used_bytes: self.global_memory.used(),
            global_memory_cap_bytes: self.config.global_memory_cap_bytes,
        }
    }
}

/// Reserve one admission slot for a database, failing with `Backpressure`
/// rather than blocking if its queue is already at `limit`.
fn reserve_slot(depth: &AtomicUsize, limit: usize) -> Result<()> {
    loop {
        let current = depth.load(Ordering::Acquire);
        if current >= limit {
            return Err(Error::Backpressure);
        }
        if depth
            .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// Worker loop: not partition-bound (§4.9) — a worker just pulls the next
/// ready batch off the shared channel and runs it wherever it routes.
fn worker_loop(rx: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = {
            let guard = rx.lock();
            guard.recv()
        };
        match task {
            Ok(Task { db, ops, reply }) => {
                let result = db.execute(ops);
                let _ = reply.send(result);
            }
            Err(_) => return, // sender side dropped: pool is shutting down
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Dropping the sender lets every worker's blocking `recv` return
        // `Err` and exit; only then is it safe to join them.
        self.task_tx.take();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}
