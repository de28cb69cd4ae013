//! WAL operation tags (§3 "WAL record").

use crate::error::Error;

/// The kind of a WAL record's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Insert a new document version; fails if one is already visible.
    Create,
    /// Replace the payload of a visible document.
    Update,
    /// Tombstone the currently visible version.
    Delete,
    /// Marks the end of a transaction's records; triggers apply on replay.
    Commit,
    /// Marks that all `tx_id <= checkpoint_tx` have been applied and the
    /// data file is consistent up to a recorded offset.
    Checkpoint,
}

impl OpType {
    /// Encode as the single byte used on the wire and on disk.
    pub fn to_byte(self) -> u8 {
        match self {
            OpType::Create => 0,
            OpType::Update => 1,
            OpType::Delete => 2,
            OpType::Commit => 3,
            OpType::Checkpoint => 4,
        }
    }

    /// Decode from the on-disk byte, rejecting anything else as corrupt.
    pub fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            0 => Ok(OpType::Create),
            1 => Ok(OpType::Update),
            2 => Ok(OpType::Delete),
            3 => Ok(OpType::Commit),
            4 => Ok(OpType::Checkpoint),
            other => Err(Error::CorruptRecord(format!("unknown op_type byte {other}"))),
        }
    }

    /// `true` for Create/Update/Delete — records that carry real document
    /// operations buffered until their matching `Commit` is seen.
    pub fn is_document_op(self) -> bool {
        matches!(self, OpType::Create | OpType::Update | OpType::Delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        for op in [
            OpType::Create,
            OpType::Update,
            OpType::Delete,
            OpType::Commit,
            OpType::Checkpoint,
        ] {
            assert_eq!(OpType::from_byte(op.to_byte()).unwrap(), op);
        }
    }

    #[test]
    fn rejects_unknown_byte() {
        assert!(OpType::from_byte(255).is_err());
    }

    #[test]
    fn only_create_update_delete_are_document_ops() {
        assert!(OpType::Create.is_document_op());
        assert!(OpType::Update.is_document_op());
        assert!(OpType::Delete.is_document_op());
        assert!(!OpType::Commit.is_document_op());
        assert!(!OpType::Checkpoint.is_document_op());
    }
}
