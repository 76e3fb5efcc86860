//! Download coherency: gate foreground I/O on the background download.
//!
//! Every operation that touches cache-file bytes first calls
//! [`Coherency::await_range`] with the offset it needs bytes up to. The loop
//! re-reads the cache-file attributes until either the download has moved past
//! that offset, the download has finished, or it has failed. Reads far ahead of
//! the download cursor may instead be served once, directly from the daemon.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::cache_file::{CacheAttrs, CacheFile, DownloadFlags, DownloadStatus};
use crate::config::MountConfig;
use crate::error::FsError;
use crate::node::{Node, NodeStatus};
use crate::protocol::{Credentials, ObjectRequest, Op, ReadBytesRequest};
use crate::transport::Transport;
use crate::vfs::VfsHost;

/// A byte range a read may fetch directly if it lands far ahead of the download.
#[derive(Debug, Clone, Copy)]
pub struct DirectFetch<'a> {
    pub creds: &'a Credentials,
    pub offset: u64,
    pub len: u64,
}

/// How [`Coherency::await_range`] was satisfied.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// The cache-file holds the required bytes (or the download is over).
    Present(CacheAttrs),
    /// The bytes were fetched directly; the cache-file was not touched.
    Fetched(Bytes),
}

/// Tunables of the coherency loop.
#[derive(Debug, Clone, Copy)]
pub struct Coherency {
    poll_interval: Duration,
    wait_if_within: u64,
    max_direct_fetch: u64,
}

impl Coherency {
    #[must_use]
    pub fn new(config: &MountConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            wait_if_within: config.wait_if_within.as_u64(),
            max_direct_fetch: config.max_io_buffer_size.as_u64(),
        }
    }

    /// Waits until `cache` can serve bytes up to `required_end`.
    ///
    /// Fails with [`FsError::DownloadFailed`] once the agent reports failure,
    /// and with [`FsError::GoingAway`] if a forced unmount interrupts a wait.
    /// `direct` is tried at most once per call.
    pub async fn await_range(
        &self,
        transport: &Transport,
        node: &Node,
        cache: &dyn CacheFile,
        required_end: u64,
        mut direct: Option<DirectFetch<'_>>,
    ) -> Result<Readiness, FsError> {
        let mut signal = cache.download().subscribe();
        let mut high_water = 0;

        loop {
            signal.borrow_and_update();
            let attrs = cache.attributes().await?;
            let flags = attrs.download.flags;

            if flags.contains(DownloadFlags::DOWNLOAD_FAILED) {
                debug!(remote_id = ?node.remote_id(), "background download failed");
                return Err(FsError::DownloadFailed);
            }

            let downloading = flags.contains(DownloadFlags::DOWNLOADING);
            // A size below one already observed mid-download is not progress.
            let regressed = downloading && attrs.size < high_water;
            high_water = high_water.max(attrs.size);
            if !regressed && !(downloading && required_end > attrs.size) {
                return Ok(Readiness::Present(attrs));
            }

            if let Some(fetch) = direct.take() {
                if required_end > attrs.size.saturating_add(self.wait_if_within) {
                    if let Some(bytes) = self.fetch_direct(transport, node, fetch).await? {
                        return Ok(Readiness::Fetched(bytes));
                    }
                }
            }

            trace!(
                required_end,
                size = attrs.size,
                version = attrs.download.version,
                "waiting for background download"
            );
            self.pause(transport, &mut signal).await?;
        }
    }

    /// Like [`await_range`](Self::await_range) without a direct fetch.
    pub async fn await_present(
        &self,
        transport: &Transport,
        node: &Node,
        cache: &dyn CacheFile,
        required_end: u64,
    ) -> Result<CacheAttrs, FsError> {
        match self
            .await_range(transport, node, cache, required_end, None)
            .await?
        {
            Readiness::Present(attrs) => Ok(attrs),
            Readiness::Fetched(_) => Err(FsError::integrity(
                Errno::EIO,
                "direct fetch served a wait that offered none",
            )),
        }
    }

    /// Waits for the whole download to finish, whatever its size.
    pub async fn await_complete(
        &self,
        transport: &Transport,
        node: &Node,
        cache: &dyn CacheFile,
    ) -> Result<CacheAttrs, FsError> {
        self.await_present(transport, node, cache, u64::MAX).await
    }

    /// Pushes a dirty node's body to the server.
    ///
    /// Clean and deleted nodes return without a round trip. The whole body is
    /// downloaded first, mapped pages are written back if the node was ever
    /// mapped, and DIRTY is cleared only after FSYNC succeeds and only if no
    /// write landed in the meantime.
    #[instrument(name = "Coherency::flush", skip_all, fields(remote_id = ?node.remote_id()))]
    pub async fn flush<V: VfsHost>(
        &self,
        host: &V,
        transport: &Transport,
        node: &Arc<Node>,
        cache: &dyn CacheFile,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        if !node.has(NodeStatus::DIRTY) || node.has(NodeStatus::DELETED) {
            return Ok(());
        }

        let attrs = self.await_complete(transport, node, cache).await?;
        if node.size() != attrs.size {
            node.set_size(attrs.size);
            host.set_size(node, attrs.size);
        }

        if node.has(NodeStatus::WAS_MEMORY_MAPPED) && attrs.size > 0 {
            host.sync_range(node, 0..attrs.size).await.map_err(|e| {
                debug!(error = %e, "writing back mapped pages failed");
                FsError::Posix(Errno::EIO)
            })?;
        }

        let epoch = node.write_epoch();
        transport
            .call(&ObjectRequest {
                op: Op::Fsync,
                creds: creds.clone(),
                obj: node.remote_id(),
            })
            .await?
            .reply::<()>()?;

        if !node.clear_dirty_since(epoch) {
            debug!("written while flushing, staying dirty");
        }
        Ok(())
    }

    /// Sleeps one poll interval, waking early on a new download status.
    async fn pause(
        &self,
        transport: &Transport,
        signal: &mut watch::Receiver<DownloadStatus>,
    ) -> Result<(), FsError> {
        let cancelled = transport.cancellation();
        tokio::select! {
            biased;
            () = cancelled.cancelled() => Err(FsError::GoingAway),
            changed = signal.changed() => {
                if changed.is_err() {
                    // Agent side is gone; fall back to plain polling.
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(())
            }
            () = tokio::time::sleep(self.poll_interval) => Ok(()),
        }
    }

    /// One READ-BYTES round trip. `None` means "declined, wait instead".
    async fn fetch_direct(
        &self,
        transport: &Transport,
        node: &Node,
        fetch: DirectFetch<'_>,
    ) -> Result<Option<Bytes>, FsError> {
        if fetch.offset == 0 || fetch.len == 0 || fetch.len > self.max_direct_fetch {
            return Ok(None);
        }
        let request = ReadBytesRequest {
            creds: fetch.creds.clone(),
            obj: node.remote_id(),
            offset: fetch.offset,
            count: fetch.len,
        };
        match transport.call(&request).await {
            Ok(exchange) if exchange.status == 0 && exchange.body.len() as u64 == fetch.len => {
                trace!(offset = fetch.offset, len = fetch.len, "served by direct fetch");
                Ok(Some(exchange.body))
            }
            Ok(exchange) => {
                debug!(
                    status = exchange.status,
                    got = exchange.body.len(),
                    wanted = fetch.len,
                    "direct fetch declined"
                );
                Ok(None)
            }
            Err(e) => {
                let e = FsError::from(e);
                if e.is_going_away() {
                    return Err(e);
                }
                debug!(error = %e, "direct fetch failed");
                Ok(None)
            }
        }
    }
}
