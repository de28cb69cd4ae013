//! The error taxonomy for DocDB.
//!
//! Per the error handling design, this is a closed set of variants meant to
//! be matched by identity, not by string. `IOError` carries its own
//! transient/permanent classification as a field rather than a second type,
//! so callers still match on a single outer variant.

use std::io;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an I/O failure is worth a bounded retry or must surface directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Likely to succeed on retry (e.g. `EINTR`, transient `EAGAIN`).
    Transient,
    /// Will not succeed on retry (e.g. `ENOSPC`, permission errors).
    Permanent,
}

impl IoClass {
    /// Classify a [`std::io::Error`] using its `ErrorKind`.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                IoClass::Transient
            }
            _ => IoClass::Permanent,
        }
    }
}

/// The stable error taxonomy returned by all DocDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload is not well-formed JSON, or exceeds the configured size bound.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No visible version exists for the requested `(collection, doc_id)`.
    #[error("document not found")]
    NotFound,

    /// A create found an already-visible version for the target document.
    #[error("document already exists")]
    AlreadyExists,

    /// Per-database or global memory cap would be exceeded by this write.
    #[error("memory limit exceeded")]
    MemoryLimit,

    /// The scheduler's bounded queue for this database is full.
    #[error("backpressure: queue full")]
    Backpressure,

    /// SSI-lite conflict detected at commit time.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// A WAL or data-file record failed to decode (bad length, bad version,
    /// truncated payload).
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// A WAL or data-file record decoded structurally but its CRC did not
    /// match its content.
    #[error("CRC mismatch: {0}")]
    CRCMismatch(String),

    /// Underlying file or syscall failure.
    #[error("I/O error ({class:?}): {source}")]
    IOError {
        /// Transient vs. permanent classification.
        class: IoClass,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The referenced logical database has not been opened.
    #[error("database not open")]
    DBNotOpen,

    /// The referenced logical database is tombstoned.
    #[error("database deleted")]
    DBDeleted,
}

impl Error {
    /// `true` for errors that are safe to retry with backoff (transient I/O
    /// only — every other variant is a durable, deterministic outcome).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::IOError {
                class: IoClass::Transient,
                ..
            }
        )
    }

    /// Construct an I/O error, classifying it from its `ErrorKind`.
    pub fn io(source: io::Error) -> Self {
        let class = IoClass::classify(&source);
        Error::IOError { class, source }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::io(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_retryable() {
        let err = Error::io(io::Error::new(io::ErrorKind::Interrupted, "eintr"));
        assert!(err.is_retryable());
    }

    #[test]
    fn permanent_io_is_not_retryable() {
        let err = Error::io(io::Error::new(io::ErrorKind::PermissionDenied, "eacces"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_variants_are_not_retryable() {
        assert!(!Error::NotFound.is_retryable());
        assert!(!Error::AlreadyExists.is_retryable());
        assert!(!Error::Backpressure.is_retryable());
    }
}
