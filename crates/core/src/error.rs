//! The unified error type for all Meridian operations.
//!
//! Every error a command can surface maps to one of the variants below. The
//! variants mirror the wire-visible error strings, so `Display` output is what
//! clients see. Two classification helpers matter to callers:
//!
//! - [`Error::is_fatal`]: AOF write failures poison the server; once one is
//!   observed the process must stop accepting writes.
//! - [`Error::is_retryable`]: scans interrupted by a pending writer may retry
//!   from their cursor.

use thiserror::Error;

/// Result type alias used across all Meridian crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the database core.
#[derive(Debug, Error)]
pub enum Error {
    /// Command parse failure or an out-of-range value.
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    /// Wrong token count for the command.
    #[error("invalid number of arguments")]
    InvalidNumberOfArguments,

    /// Named collection does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// Item does not exist within the collection.
    #[error("id not found")]
    IdNotFound,

    /// Item already exists (SET ... NX).
    #[error("id already exists")]
    IdAlreadyExists,

    /// Configured memory cap exceeded; the write was rejected pre-mutation.
    #[error("out of memory")]
    OutOfMemory,

    /// Write attempted while the server is in read-only mode.
    #[error("read only")]
    ReadOnly,

    /// Write attempted on a follower.
    #[error("not the leader")]
    NotLeader,

    /// Read attempted on a follower that has not finished its first sync.
    #[error("catching up to leader")]
    CatchingUp,

    /// A scan observed the scheduler's read deadline; recoverable by retry.
    #[error("interrupted")]
    Interrupted,

    /// The operation-level deadline passed.
    #[error("deadline passed")]
    Deadline,

    /// The server is shutting down.
    #[error("closed")]
    Closed,

    /// Append-only log write or sync failure. Fatal.
    #[error("aof failure: {0}")]
    AofFailure(String),

    /// Snapshot save/load I/O error or checksum mismatch.
    #[error("snapshot failure: {0}")]
    SnapshotFailure(String),

    /// A script raised, or a script issued an unsupported command.
    #[error("script error: {0}")]
    ScriptError(String),

    /// Command is on the closed list for script contexts.
    #[error("command '{0}' not supported in scripts")]
    UnsupportedInScripts(String),

    /// Replication wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor for [`Error::InvalidArgument`].
    pub fn invalid_argument(arg: impl Into<String>) -> Self {
        Error::InvalidArgument(arg.into())
    }

    /// Fatal errors stop the server from accepting further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AofFailure(_))
    }

    /// Retryable errors may succeed when the scan re-acquires its slot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    /// The wire-safe message: literal newlines are escaped so the text always
    /// fits in a single RESP error line.
    pub fn resp_safe_message(&self) -> String {
        self.to_string().replace('\n', "\\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_display_matches_wire_strings() {
        assert_eq!(Error::KeyNotFound.to_string(), "key not found");
        assert_eq!(Error::IdNotFound.to_string(), "id not found");
        assert_eq!(Error::NotLeader.to_string(), "not the leader");
        assert_eq!(Error::CatchingUp.to_string(), "catching up to leader");
        assert_eq!(
            Error::invalid_argument("xyz").to_string(),
            "invalid argument 'xyz'"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::AofFailure("disk full".into()).is_fatal());
        assert!(!Error::SnapshotFailure("checksum".into()).is_fatal());
        assert!(!Error::Interrupted.is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Interrupted.is_retryable());
        assert!(!Error::Deadline.is_retryable());
    }

    #[test]
    fn test_resp_safe_message_escapes_newlines() {
        let err = Error::ScriptError("line one\nline two".into());
        assert!(!err.resp_safe_message().contains('\n'));
    }

    #[test]
    fn test_from_io() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
