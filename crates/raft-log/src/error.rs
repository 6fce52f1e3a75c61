//! Error taxonomy for the persistent log.
//!
//! One `thiserror` variant per failure class, with `#[from]` for the single
//! case that wraps an external error type.

use std::io;
use thiserror::Error;

/// Errors raised by the persistent audit trail.
#[derive(Error, Debug)]
pub enum LogError {
    /// An index is beyond `last_index`, a snapshot index is misaligned with
    /// a partition boundary, or a negative/out-of-bounds input was supplied.
    #[error("index out of range: {0}")]
    OutOfRange(String),

    /// A caller attempted an operation the coordinator's state machine
    /// forbids (overwriting a committed prefix, a snapshot entry inside a
    /// batch append, appending to a partition missing during apply).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A short read was observed while populating a partition or snapshot
    /// metadata cache at startup.
    #[error("unexpected eof while populating cache: {0}")]
    UnexpectedEof(String),

    /// The caller's cancellation token tripped before the operation
    /// completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A requested read span exceeds 2^31 entries.
    #[error("requested read span overflows buffer capacity: {0}")]
    BufferOverflow(String),

    /// An underlying filesystem error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The snapshot rename-swap failed mid-flight. The process aborts
    /// immediately after this is constructed; it exists mainly so the
    /// abort path has something to log on the way out.
    #[error("fatal: snapshot rename failed, state is unrecoverable in-process: {0}")]
    Fatal(String),
}

/// Result alias carrying a [`LogError`].
pub type Result<T> = std::result::Result<T, LogError>;
