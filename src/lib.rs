//! # DocDB
//!
//! An embedded, ACID, JSON-document storage engine: serialized per-partition
//! writers, a sharded MVCC index, write-ahead logging with deterministic
//! crash recovery, and multi-partition two-phase commit.
//!
//! ```no_run
//! use docdb::DocDb;
//!
//! fn main() -> docdb::Result<()> {
//!     let db = DocDb::open("./data")?;
//!     let orders = db.open_db("orders")?;
//!     orders.create("customers", 1, br#"{"name":"Ada"}"#)?;
//!     assert_eq!(orders.read("customers", 1)?.unwrap(), br#"{"name":"Ada"}"#);
//!     Ok(())
//! }
//! ```
//!
//! Internal crates (storage, concurrency, durability, engine, api) are not
//! exposed directly; this facade is the stable embeddable surface.

pub use docdb_core::error::{Error, Result};
use docdb_core::ids::DbId;
use docdb_engine::{DbOp, EngineConfig, Pool, PoolStats};
use std::path::Path;
use std::sync::Arc;

/// The engine instance for one data directory.
pub struct DocDb {
    pool: Arc<Pool>,
}

impl DocDb {
    /// Open (or create) the engine's data directory with default
    /// configuration.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(dir, EngineConfig::default())
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Ok(DocDb { pool: Pool::open(dir.as_ref(), config)? })
    }

    /// Open (creating if new) a named logical database.
    pub fn open_db(&self, name: &str) -> Result<Handle> {
        let db_id = self.pool.open_db(name)?;
        Ok(Handle { pool: Arc::clone(&self.pool), db_id })
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// A handle to one open logical database.
pub struct Handle {
    pool: Arc<Pool>,
    db_id: DbId,
}

impl Handle {
    pub fn create(&self, collection: &str, doc_id: u64, payload: &[u8]) -> Result<()> {
        self.execute(vec![DbOp::Create {
            collection: collection.to_string(),
            doc_id,
            payload: payload.to_vec(),
        }])?;
        Ok(())
    }

    pub fn read(&self, collection: &str, doc_id: u64) -> Result<Option<Vec<u8>>> {
        let mut results =
            self.execute(vec![DbOp::Read { collection: collection.to_string(), doc_id }])?;
        Ok(results.pop().flatten())
    }

    pub fn update(&self, collection: &str, doc_id: u64, payload: &[u8]) -> Result<()> {
        self.execute(vec![DbOp::Update {
            collection: collection.to_string(),
            doc_id,
            payload: payload.to_vec(),
        }])?;
        Ok(())
    }

    pub fn delete(&self, collection: &str, doc_id: u64) -> Result<()> {
        self.execute(vec![DbOp::Delete { collection: collection.to_string(), doc_id }])?;
        Ok(())
    }

    /// Run an arbitrary batch of ops as one transaction (§4.6).
    pub fn execute(&self, ops: Vec<DbOp>) -> Result<Vec<Option<Vec<u8>>>> {
        self.pool.execute(self.db_id, ops)
    }

    /// Close this database, releasing its in-memory state; a later
    /// `DocDb::open_db` for the same name reopens it from disk.
    pub fn close(self) -> Result<()> {
        self.pool.close_db(self.db_id)
    }
}
