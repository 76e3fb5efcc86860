//! Error taxonomy shared by every layer, and its mapping onto POSIX errnos.

use nix::errno::Errno;
use thiserror::Error;

/// A reply that does not have the shape its operation requires.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown operation tag {0}")]
    UnknownOp(u32),

    #[error("unknown object kind {0}")]
    UnknownKind(u8),

    #[error("unexpected {what} length: expected {expected}, got {actual}")]
    UnexpectedLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("frame of {0} bytes exceeds the transfer limit")]
    Oversized(usize),
}

/// Why a single exchange with the daemon failed.
///
/// These are diagnostic only: callers see all of them as EIO.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("daemon refused the connection")]
    Refused(#[source] std::io::Error),

    #[error("daemon endpoint does not exist")]
    NoEndpoint(#[source] std::io::Error),

    #[error("timed out waiting for the daemon reply")]
    Timeout,

    #[error("I/O error on the daemon channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed reply: {0}")]
    Malformed(#[from] ProtocolError),
}

/// Error surfaced by the Transport/Session Manager.
///
/// Only two outcomes exist: the mount is going away, or the exchange failed for
/// some other reason which callers treat as a generic I/O error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("the mount is going away")]
    GoingAway,

    #[error("daemon exchange failed: {0}")]
    Failed(#[from] ExchangeError),
}

impl TransportError {
    /// The errno a caller observes for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::GoingAway => libc::ENXIO,
            Self::Failed(_) => libc::EIO,
        }
    }
}

/// Error returned by every operation handler.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("the mount is going away")]
    GoingAway,

    #[error(transparent)]
    Transport(TransportError),

    /// A status word reported by the daemon, passed through unchanged.
    #[error("daemon reported {}", Errno::from_raw(*.0))]
    Server(i32),

    #[error("background download of the cache file failed")]
    DownloadFailed,

    #[error("protocol integrity violation: {reason}")]
    Integrity { errno: Errno, reason: String },

    #[error("cache file I/O failed: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("{0}")]
    Posix(Errno),
}

impl FsError {
    /// The errno a POSIX caller observes for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::GoingAway => libc::ENXIO,
            Self::Transport(e) => e.errno(),
            Self::Server(status) => *status,
            Self::DownloadFailed => libc::EIO,
            Self::Integrity { errno, .. } | Self::Posix(errno) => *errno as i32,
            Self::CacheIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether this error means the mount is being torn down.
    #[must_use]
    pub fn is_going_away(&self) -> bool {
        matches!(
            self,
            Self::GoingAway | Self::Transport(TransportError::GoingAway)
        )
    }

    pub(crate) fn integrity(errno: Errno, reason: impl Into<String>) -> Self {
        Self::Integrity {
            errno,
            reason: reason.into(),
        }
    }
}

impl From<Errno> for FsError {
    fn from(errno: Errno) -> Self {
        Self::Posix(errno)
    }
}

impl From<TransportError> for FsError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::GoingAway => Self::GoingAway,
            other @ TransportError::Failed(_) => Self::Transport(other),
        }
    }
}

impl From<ProtocolError> for FsError {
    fn from(e: ProtocolError) -> Self {
        Self::integrity(Errno::EINVAL, e.to_string())
    }
}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        Self::from_raw_os_error(e.errno())
    }
}
