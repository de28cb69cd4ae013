//! Boundary-only bridge from wire [`Command`]s to [`Pool`] calls (§2 "Control
//! flow: client frame → dispatcher → pool → …").
//!
//! This module owns no state of its own beyond the `Pool` handle; it only
//! translates wire types to engine types and engine `Result`s back to
//! [`Response`] frames. Framing and transport (the actual socket loop) are
//! out of scope here, same as the rest of the IPC collaborator (§1).

use crate::wire::{Command, Op, Response, Status};
use docdb_core::error::Error;
use docdb_core::ids::DbId;
use docdb_engine::{DbOp, Pool, PoolStats};
use std::sync::Arc;

fn to_db_op(op: Op) -> DbOp {
    match op {
        Op::Create { collection, doc_id, payload } => DbOp::Create { collection, doc_id, payload },
        Op::Read { collection, doc_id } => DbOp::Read { collection, doc_id },
        Op::Update { collection, doc_id, payload } => DbOp::Update { collection, doc_id, payload },
        Op::Delete { collection, doc_id } => DbOp::Delete { collection, doc_id },
    }
}

/// Dispatches one decoded [`Command`] against a [`Pool`] and produces the
/// payload bytes for a [`Response`] (status is derived by the caller from
/// whether this returns `Ok`).
pub struct Dispatcher {
    pool: Arc<Pool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>) -> Self {
        Dispatcher { pool }
    }

    /// Run `command` and build a complete response frame body, including
    /// translating an `Err` into `Status::Error` with the error's message
    /// as the payload — the wire protocol has no structured error payload
    /// (§6), only a human-readable one.
    pub fn dispatch(&self, request_id: u64, command: Command) -> Response {
        match self.run(command) {
            Ok(payload) => Response { request_id, status: Status::Ok, payload },
            Err(e) => Response { request_id, status: Status::Error, payload: e.to_string().into_bytes() },
        }
    }

    fn run(&self, command: Command) -> Result<Vec<u8>, Error> {
        match command {
            Command::OpenDb { name } => {
                let db_id = self.pool.open_db(&name)?;
                Ok(db_id.0.to_le_bytes().to_vec())
            }
            Command::CloseDb { db_id } => {
                self.pool.close_db(DbId(db_id))?;
                Ok(Vec::new())
            }
            Command::Execute { db_id, ops } => {
                let db_ops: Vec<DbOp> = ops.into_iter().map(to_db_op).collect();
                let results = self.pool.execute(DbId(db_id), db_ops)?;
                Ok(encode_execute_results(&results))
            }
            Command::Stats => Ok(encode_stats(self.pool.stats())),
        }
    }
}

/// `[4 count][{1 present}{4 len}{bytes}]*` — one entry per op, `present`
/// distinguishing "absent document" from "zero-length payload".
fn encode_execute_results(results: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(results.len() as u32).to_le_bytes());
    for result in results {
        match result {
            Some(payload) => {
                out.push(1);
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            None => out.push(0),
        }
    }
    out
}

/// `[8 open_db_count][8 global_memory_used_bytes][8 global_memory_cap_bytes]`.
fn encode_stats(stats: PoolStats) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&(stats.open_db_count as u64).to_le_bytes());
    out.extend_from_slice(&stats.global_memory_used_bytes.to_le_bytes());
    out.extend_from_slice(&stats.global_memory_cap_bytes.to_le_bytes());
    out
}
