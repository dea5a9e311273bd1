//! Engine-wide error taxonomy (§7): five kinds, chosen by how a caller should react rather than
//! by which module raised them.

use governor::InsufficientCapacity;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A peer sent something that violates the wire protocol. The session that saw it is torn
    /// down; other peers of the same torrent are unaffected.
    #[error("protocol violation: {0:#}")]
    Protocol(#[source] anyhow::Error),

    /// A transient I/O failure: a dial timeout, a reset connection, a short read. Recoverable by
    /// retrying the peer later; never propagated past the session that hit it.
    #[error("transient I/O error: {0:#}")]
    TransientIo(#[source] std::io::Error),

    /// The rate limiter or a bounded channel has no room left right now.
    #[error("resource exhausted: {0:#}")]
    ResourceExhausted(#[source] anyhow::Error),

    /// The registry or chunk assigner observed a state that its invariants say can't happen
    /// (double-store of a chunk, subtracting more `left` than is outstanding, an unknown
    /// torrent id). Surfaced rather than silently ignored, since it means a bookkeeping bug.
    #[error("registry inconsistency: {0:#}")]
    RegistryInconsistency(#[source] anyhow::Error),

    /// A config key was missing, malformed, or out of range.
    #[error("configuration error: {0:#}")]
    Configuration(#[source] anyhow::Error),
}

impl From<InsufficientCapacity> for Error {
    fn from(e: InsufficientCapacity) -> Self {
        Error::ResourceExhausted(anyhow::Error::from(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransientIo(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
