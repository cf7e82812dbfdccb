//! Error taxonomy for the client.
//!
//! Every failure is surfaced immediately to the caller of the failing
//! operation; nothing in this crate retries. Re-sending `guest-exec`
//! would launch a duplicate process in the guest, and the write protocol
//! cannot resume mid-chunk.

use std::path::PathBuf;
use std::time::Duration;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum QgaError {
    /// The agent socket is unreachable or does not exist.
    #[error("unable to connect to {}: {source}", .endpoint.display())]
    Connection {
        endpoint: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or incomplete response: empty read, invalid JSON, or a
    /// missing required field such as `pid` or the file handle.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The exec poll loop exceeded its deadline. The guest process may
    /// still be running; the protocol has no cancel primitive.
    #[error("guest-exec timed out after {elapsed:?}: {command}")]
    Timeout { command: String, elapsed: Duration },

    /// The agent acknowledged fewer bytes than the chunk carried.
    #[error("incomplete write to guest: sent {sent} bytes, agent acknowledged {acknowledged}")]
    ShortWrite { sent: usize, acknowledged: u64 },

    /// The local push source is not an existing regular file.
    #[error("source file does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// Local I/O failure (socket read/write, source file read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, QgaError>;
