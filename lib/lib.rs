//! dav-fs shared library.
//!
//! The kernel-side half of a WebDAV-backed filesystem. Every operation is
//! forwarded to a user-space daemon over a local socket; file bodies live in
//! daemon-owned cache-files that the daemon may still be downloading while the
//! host reads them.

pub mod binding;
/// Cache-file handles and their download state.
pub mod cache_file;
pub mod coherency;
/// Mount configuration.
pub mod config;
pub mod error;
/// One in-memory object per remote object.
pub mod identity;
pub mod node;
/// Operation handlers for the host VFS.
pub mod ops;
/// Daemon wire format.
pub mod protocol;
pub mod transport;
/// The seam to the host virtual filesystem.
pub mod vfs;

pub use config::MountConfig;
pub use error::FsError;
pub use ops::DavFs;
