//! Byte and page transfers between callers and a node's cache-file.
//!
//! All four paths wait on the coherency coordinator before touching the
//! cache-file. Nodes that were ever memory mapped may hold newer bytes in the
//! host page cache than in the cache-file, so reads and writes on them go page
//! run by page run: resident runs are copied to or from the pages, the rest is
//! passed through to the cache-file.

use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, instrument, trace};

use super::DavFs;
use crate::cache_file::{AttrUpdate, CacheFile};
use crate::coherency::{DirectFetch, Readiness};
use crate::error::FsError;
use crate::node::{Node, NodeStatus};
use crate::protocol::Credentials;
use crate::vfs::{PAGE_SIZE, PageFlags, PageList, PageListGuard, VfsHost, page_runs};

/// Largest span one page list covers on the mapped path.
const MAX_MAPPED_CHUNK: usize = 1 << 20;

/// A pagein or pageout request from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Byte offset into the page list where the transfer starts.
    pub list_offset: usize,
    /// File offset of the first byte.
    pub file_offset: u64,
    pub size: usize,
    pub flags: PageFlags,
}

enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(data) => data.len(),
        }
    }

    fn is_read(&self) -> bool {
        matches!(self, Self::Read(_))
    }
}

fn round_up_to_page(offset: u64) -> u64 {
    let page = PAGE_SIZE as u64;
    offset.div_ceil(page).saturating_mul(page)
}

impl<V: VfsHost> DavFs<V> {
    /// Reads into `buf` at `offset`. Returns the byte count, short at end of file.
    #[instrument(name = "DavFs::read", skip(self, node, buf, creds), fields(remote_id = ?node.remote_id(), len = buf.len()))]
    pub async fn read(
        &self,
        node: &Arc<Node>,
        offset: u64,
        buf: &mut [u8],
        creds: &Credentials,
    ) -> Result<usize, FsError> {
        self.rdwr(node, offset, Transfer::Read(buf), creds).await
    }

    /// Writes `data` at `offset`, growing the file if needed.
    #[instrument(name = "DavFs::write", skip(self, node, data, creds), fields(remote_id = ?node.remote_id(), len = data.len()))]
    pub async fn write(
        &self,
        node: &Arc<Node>,
        offset: u64,
        data: &[u8],
        creds: &Credentials,
    ) -> Result<usize, FsError> {
        self.rdwr(node, offset, Transfer::Write(data), creds).await
    }

    async fn rdwr(
        &self,
        node: &Arc<Node>,
        offset: u64,
        mut xfer: Transfer<'_>,
        creds: &Credentials,
    ) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(Errno::EISDIR.into());
        }
        let Some(cache) = node.cache_file() else {
            debug!("I/O on a node without a cache file");
            return Err(Errno::EIO.into());
        };
        let reading = xfer.is_read();
        if reading {
            node.insert_status(NodeStatus::ACCESSED);
        }

        let len = xfer.len() as u64;
        let end = offset.checked_add(len).ok_or(Errno::EFBIG)?;
        let direct = (reading && len > 0).then_some(DirectFetch {
            creds,
            offset,
            len,
        });

        let attrs = match self
            .coherency
            .await_range(
                &self.transport,
                node,
                cache.as_ref(),
                round_up_to_page(end),
                direct,
            )
            .await?
        {
            Readiness::Fetched(bytes) => {
                if let Transfer::Read(buf) = xfer {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                }
                return Ok(bytes.len());
            }
            Readiness::Present(attrs) => attrs,
        };
        self.sync_grown_size(node, attrs.size);

        let total = match &xfer {
            Transfer::Read(buf) => {
                let available = attrs.size.saturating_sub(offset);
                usize::try_from(available).map_or(buf.len(), |available| available.min(buf.len()))
            }
            Transfer::Write(data) => data.len(),
        };

        let done = if node.has(NodeStatus::WAS_MEMORY_MAPPED) {
            self.transfer_mapped(node, cache.as_ref(), offset, &mut xfer, total)
                .await?
        } else {
            match &mut xfer {
                Transfer::Read(buf) => cache.read_at(&mut buf[..total], offset).await?,
                Transfer::Write(data) => {
                    let written = cache.write_at(data, offset).await?;
                    node.mark_dirty();
                    written
                }
            }
        };

        if !reading {
            let new_end = offset + done as u64;
            if new_end > attrs.size {
                cache
                    .set_attributes(AttrUpdate {
                        size: Some(new_end),
                        ..AttrUpdate::default()
                    })
                    .await?;
                node.set_size(new_end);
                self.host.set_size(node, new_end);
            }
        }
        Ok(done)
    }

    /// Moves `total` bytes through page lists of at most [`MAX_MAPPED_CHUNK`].
    async fn transfer_mapped(
        &self,
        node: &Arc<Node>,
        cache: &dyn CacheFile,
        offset: u64,
        xfer: &mut Transfer<'_>,
        total: usize,
    ) -> Result<usize, FsError> {
        let mut done = 0;
        while done < total {
            let pos = offset + done as u64;
            #[expect(clippy::cast_possible_truncation, reason = "remainder of a page size")]
            let lead = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (total - done).min(MAX_MAPPED_CHUNK - lead);
            let list_len = (lead + chunk).div_ceil(PAGE_SIZE) * PAGE_SIZE;

            let mut pages =
                PageListGuard::new(self.host.page_list(node, pos - lead as u64, list_len)?);
            let mut lead = lead;
            let mut left = chunk;

            for run in page_runs(&*pages.pages()) {
                if left == 0 {
                    break;
                }
                let wanted = left.min(run.pages.len() * PAGE_SIZE - lead);
                let list_pos = run.pages.start * PAGE_SIZE + lead;
                let file_pos = offset + done as u64;
                let span = done..done + wanted;

                let moved = match (&mut *xfer, run.resident) {
                    (Transfer::Read(buf), true) => {
                        pages.pages().read(list_pos, &mut buf[span]);
                        wanted
                    }
                    (Transfer::Write(data), true) => {
                        pages.pages().write(list_pos, &data[span]);
                        wanted
                    }
                    (Transfer::Read(buf), false) => cache.read_at(&mut buf[span], file_pos).await?,
                    (Transfer::Write(data), false) => cache.write_at(&data[span], file_pos).await?,
                };
                if !xfer.is_read() {
                    node.mark_dirty();
                }
                trace!(resident = run.resident, pages = ?run.pages, moved, "page run");

                done += moved;
                if moved < wanted {
                    pages.abort(true);
                    return Ok(done);
                }
                left -= wanted;
                lead = 0;
            }
            pages.abort(false);
        }
        Ok(done)
    }

    /// Fills host pages from the cache-file, zeroing bytes past end of file.
    ///
    /// Pages are committed on success and aborted as failed otherwise, unless
    /// [`PageFlags::NO_COMMIT`] hands that to the caller.
    #[instrument(name = "DavFs::pagein", skip(self, node, pages, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn pagein<P: PageList>(
        &self,
        node: &Arc<Node>,
        mut pages: P,
        request: PageRequest,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        if request.flags.contains(PageFlags::NO_COMMIT) {
            return self.fill_pages(node, &mut pages, request, creds).await;
        }
        let mut guard = PageListGuard::new(pages);
        match self.fill_pages(node, guard.pages(), request, creds).await {
            Ok(()) => {
                guard.commit();
                Ok(())
            }
            Err(e) => {
                guard.abort(true);
                Err(e)
            }
        }
    }

    async fn fill_pages<P: PageList>(
        &self,
        node: &Arc<Node>,
        pages: &mut P,
        request: PageRequest,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        let Some(cache) = node.cache_file() else {
            return Err(Errno::EIO.into());
        };
        let size = request.size as u64;
        let end = request.file_offset.checked_add(size).ok_or(Errno::EFBIG)?;
        let direct = DirectFetch {
            creds,
            offset: request.file_offset,
            len: size,
        };

        let attrs = match self
            .coherency
            .await_range(&self.transport, node, cache.as_ref(), end, Some(direct))
            .await?
        {
            Readiness::Fetched(bytes) => {
                pages.write(request.list_offset, &bytes);
                return Ok(());
            }
            Readiness::Present(attrs) => attrs,
        };
        self.sync_grown_size(node, attrs.size);

        if request.file_offset > attrs.size {
            return Err(Errno::EFAULT.into());
        }
        let mut buf = vec![0; request.size];
        let filled = cache.read_at(&mut buf, request.file_offset).await?;
        trace!(filled, zeroed = request.size - filled, "paged in");
        pages.write(request.list_offset, &buf);
        Ok(())
    }

    /// Writes host pages back into the cache-file, truncated at end of file.
    ///
    /// The node is marked dirty whether or not the write succeeds, except on a
    /// read-only mount or while the mount is going away.
    #[instrument(name = "DavFs::pageout", skip(self, node, pages, _creds), fields(remote_id = ?node.remote_id()))]
    pub async fn pageout<P: PageList>(
        &self,
        node: &Arc<Node>,
        mut pages: P,
        request: PageRequest,
        _creds: &Credentials,
    ) -> Result<(), FsError> {
        if request.flags.contains(PageFlags::NO_COMMIT) {
            return self.drain_pages(node, &mut pages, request).await;
        }
        let mut guard = PageListGuard::new(pages);
        match self.drain_pages(node, guard.pages(), request).await {
            Ok(()) => {
                guard.commit();
                Ok(())
            }
            Err(e) => {
                guard.abort(true);
                Err(e)
            }
        }
    }

    async fn drain_pages<P: PageList>(
        &self,
        node: &Arc<Node>,
        pages: &mut P,
        request: PageRequest,
    ) -> Result<(), FsError> {
        if self.config.read_only {
            return Err(Errno::EROFS.into());
        }
        let Some(cache) = node.cache_file() else {
            return Err(Errno::EIO.into());
        };

        let result = self.write_back(node, cache.as_ref(), pages, request).await;
        if !result.as_ref().is_err_and(FsError::is_going_away) {
            node.mark_dirty();
        }
        result
    }

    async fn write_back<P: PageList>(
        &self,
        node: &Arc<Node>,
        cache: &dyn CacheFile,
        pages: &mut P,
        request: PageRequest,
    ) -> Result<(), FsError> {
        let end = request
            .file_offset
            .checked_add(request.size as u64)
            .ok_or(Errno::EFBIG)?;
        let attrs = self
            .coherency
            .await_present(&self.transport, node, cache, end)
            .await?;
        self.sync_grown_size(node, attrs.size);

        let mut size = request.size;
        if end > attrs.size {
            if request.file_offset >= attrs.size {
                return Err(Errno::EFAULT.into());
            }
            size = usize::try_from(attrs.size - request.file_offset).unwrap_or(size);
        }

        let mut data = vec![0; size];
        pages.read(request.list_offset, &mut data);
        cache.write_at(&data, request.file_offset).await?;
        Ok(())
    }
}
