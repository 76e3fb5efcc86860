//! Cache-files: local stores backing a node's body, filled in the background.
//!
//! A background agent outside this crate streams the body into the cache-file
//! after open and publishes its progress through a [`DownloadSignal`]. The
//! signal is the only channel between that agent and the foreground handlers.

use std::fs::FileTimes;
use std::os::unix::fs::{FileExt as _, MetadataExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitflags::bitflags;
use tokio::sync::watch;
use tracing::trace;

bitflags! {
    /// Progress flags set exclusively by the background download agent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DownloadFlags: u8 {
        /// The body is not fully present yet.
        const DOWNLOADING     = 1 << 0;
        /// The transfer ended in error; no further progress will happen.
        const DOWNLOAD_FAILED = 1 << 1;
    }
}

/// One version of the download-status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStatus {
    pub flags: DownloadFlags,
    /// Incremented on every publication, including pure progress.
    pub version: u64,
}

/// Versioned download-status record owned by a cache-file.
///
/// Readers take a snapshot or subscribe for changes; neither blocks the agent.
#[derive(Debug)]
pub struct DownloadSignal {
    tx: watch::Sender<DownloadStatus>,
}

impl DownloadSignal {
    #[must_use]
    pub fn new(flags: DownloadFlags) -> Self {
        Self {
            tx: watch::Sender::new(DownloadStatus { flags, version: 0 }),
        }
    }

    /// A record for a body that is already complete.
    #[must_use]
    pub fn complete() -> Self {
        Self::new(DownloadFlags::empty())
    }

    /// A record for a body whose download is still running.
    #[must_use]
    pub fn downloading() -> Self {
        Self::new(DownloadFlags::DOWNLOADING)
    }

    #[must_use]
    pub fn snapshot(&self) -> DownloadStatus {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DownloadStatus> {
        self.tx.subscribe()
    }

    /// More bytes landed in the cache-file.
    pub fn progressed(&self) {
        self.publish(|_| {});
    }

    /// The whole body is present.
    pub fn finish(&self) {
        self.publish(|flags| flags.remove(DownloadFlags::DOWNLOADING));
    }

    /// The transfer ended in error.
    pub fn fail(&self) {
        self.publish(|flags| {
            flags.remove(DownloadFlags::DOWNLOADING);
            flags.insert(DownloadFlags::DOWNLOAD_FAILED);
        });
    }

    fn publish(&self, f: impl FnOnce(&mut DownloadFlags)) {
        self.tx.send_modify(|status| {
            f(&mut status.flags);
            status.version += 1;
            trace!(flags = ?status.flags, version = status.version, "download status published");
        });
    }
}

/// Live attributes of a cache-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAttrs {
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub download: DownloadStatus,
}

/// Attribute changes to apply to a cache-file. `None` leaves a field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrUpdate {
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Local store backing a node's body bytes.
#[async_trait]
pub trait CacheFile: Send + Sync {
    /// The download-status record published by the background agent.
    fn download(&self) -> &DownloadSignal;

    async fn attributes(&self) -> std::io::Result<CacheAttrs>;

    /// Reads up to `buf.len()` bytes at `offset`; short only at end of file.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;

    /// Writes all of `data` at `offset`, extending the file if needed.
    async fn write_at(&self, data: &[u8], offset: u64) -> std::io::Result<usize>;

    async fn set_attributes(&self, update: AttrUpdate) -> std::io::Result<()>;
}

/// A cache-file stored in the local file system.
#[derive(Debug)]
pub struct LocalCacheFile {
    path: PathBuf,
    file: Arc<std::fs::File>,
    signal: DownloadSignal,
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> std::io::Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

fn ctime_of(meta: &std::fs::Metadata) -> SystemTime {
    let nanos = Duration::from_nanos(u64::try_from(meta.ctime_nsec()).unwrap_or(0));
    let secs = Duration::from_secs(meta.ctime().unsigned_abs());
    if meta.ctime() >= 0 {
        UNIX_EPOCH + secs + nanos
    } else {
        UNIX_EPOCH - secs + nanos
    }
}

impl LocalCacheFile {
    /// Opens (creating if needed) the cache-file at `path`.
    pub async fn open(path: impl AsRef<Path>, signal: DownloadSignal) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let opened = path.clone();
        let file = blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&opened)
        })
        .await?;
        Ok(Self {
            path,
            file: Arc::new(file),
            signal,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CacheFile for LocalCacheFile {
    fn download(&self) -> &DownloadSignal {
        &self.signal
    }

    async fn attributes(&self) -> std::io::Result<CacheAttrs> {
        let file = Arc::clone(&self.file);
        let meta = blocking(move || file.metadata()).await?;
        Ok(CacheAttrs {
            size: meta.len(),
            atime: meta.accessed()?,
            mtime: meta.modified()?,
            ctime: ctime_of(&meta),
            download: self.signal.snapshot(),
        })
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let file = Arc::clone(&self.file);
        let mut scratch = vec![0u8; buf.len()];
        let (scratch, filled) = blocking(move || {
            let mut filled = 0;
            while filled < scratch.len() {
                match file.read_at(&mut scratch[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok((scratch, filled))
        })
        .await?;
        buf[..filled].copy_from_slice(&scratch[..filled]);
        Ok(filled)
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> std::io::Result<usize> {
        let file = Arc::clone(&self.file);
        let owned = data.to_vec();
        blocking(move || {
            file.write_all_at(&owned, offset)?;
            Ok(owned.len())
        })
        .await
    }

    async fn set_attributes(&self, update: AttrUpdate) -> std::io::Result<()> {
        let file = Arc::clone(&self.file);
        blocking(move || {
            if let Some(size) = update.size {
                file.set_len(size)?;
            }
            let mut times = FileTimes::new();
            if let Some(atime) = update.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = update.mtime {
                times = times.set_modified(mtime);
            }
            if update.atime.is_some() || update.mtime.is_some() {
                file.set_times(times)?;
            }
            Ok(())
        })
        .await
    }
}
