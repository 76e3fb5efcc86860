//! Directory listing from the directory's cache-file.

use std::sync::Arc;

use nix::errno::Errno;
use tracing::{instrument, trace};

use super::DavFs;
use crate::error::FsError;
use crate::node::{Node, NodeStatus};
use crate::protocol::{Credentials, DIR_RECORD_SIZE, DirRecord, ReaddirRequest};
use crate::vfs::VfsHost;

/// One batch of directory records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDir {
    /// Records in listing order.
    pub entries: Vec<DirRecord>,
    /// Offset to pass to the next call.
    pub next_offset: u64,
    /// No records are left past `next_offset`.
    pub eof: bool,
}

impl<V: VfsHost> DavFs<V> {
    /// Reads up to `buf_len` bytes worth of whole records starting at `offset`.
    ///
    /// The daemon rewrites the directory's cache-file when the listing starts
    /// over at offset 0 or the directory is stale.
    #[instrument(name = "DavFs::readdir", skip(self, dir, creds), fields(remote_id = ?dir.remote_id()))]
    pub async fn readdir(
        &self,
        dir: &Arc<Node>,
        offset: u64,
        buf_len: usize,
        creds: &Credentials,
    ) -> Result<ReadDir, FsError> {
        if !dir.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        let Some(cache) = dir.cache_file() else {
            return Err(Errno::EINVAL.into());
        };

        if offset == 0 || dir.has(NodeStatus::DIRECTORY_STALE) {
            let refreshed = match self
                .transport
                .call(&ReaddirRequest {
                    creds: creds.clone(),
                    obj: dir.remote_id(),
                    use_cache: self.config.use_daemon_dir_cache,
                })
                .await
            {
                Ok(exchange) => exchange.reply::<()>(),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = refreshed {
                dir.insert_status(NodeStatus::DIRECTORY_STALE);
                return Err(e);
            }
            dir.remove_status(NodeStatus::DIRECTORY_STALE);
        }

        let record = DIR_RECORD_SIZE as u64;
        if offset % record != 0 || buf_len < DIR_RECORD_SIZE {
            return Err(Errno::EINVAL.into());
        }
        let size = cache.attributes().await?.size;
        let remaining = usize::try_from(size.saturating_sub(offset)).unwrap_or(usize::MAX);
        // Never allocate past the records the listing actually holds.
        let count = buf_len.min(remaining);
        let count = count - count % DIR_RECORD_SIZE;

        let mut buf = vec![0; count];
        let filled = cache.read_at(&mut buf, offset).await?;
        let entries = buf[..filled]
            .chunks_exact(DIR_RECORD_SIZE)
            .map(DirRecord::decode)
            .collect::<Result<Vec<_>, _>>()?;

        let next_offset = offset + (entries.len() * DIR_RECORD_SIZE) as u64;
        let eof = size <= next_offset;
        trace!(entries = entries.len(), next_offset, eof, "read directory records");
        Ok(ReadDir {
            entries,
            next_offset,
            eof,
        })
    }
}
