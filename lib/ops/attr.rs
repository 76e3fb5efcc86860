//! Attribute synthesis and updates.

use std::sync::Arc;
use std::time::SystemTime;

use nix::errno::Errno;
use tracing::{debug, instrument};

use super::{DavFs, S_IFDIR, S_IFREG};
use crate::cache_file::{AttrUpdate, CacheAttrs, DownloadFlags};
use crate::error::FsError;
use crate::node::{LocalId, Node, NodeStatus, NodeTimes};
use crate::protocol::{Credentials, GetattrReply, ObjectKind, ObjectRequest, Op};
use crate::vfs::VfsHost;

/// Owner reported for every object; the server has no notion of local users.
pub const UNKNOWN_ID: u32 = 99;

const BLOCK_SIZE: u32 = 4096;

/// POSIX-visible attributes of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: LocalId,
    pub kind: ObjectKind,
    /// Type and permission bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Attribute changes requested through setattr. `None` leaves a field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

fn blocks_for(size: u64) -> u64 {
    size.div_ceil(u64::from(BLOCK_SIZE)) * u64::from(BLOCK_SIZE / 512)
}

impl<V: VfsHost> DavFs<V> {
    /// Synthesizes the node's attributes.
    ///
    /// A bound file whose download is neither running nor failed answers from
    /// the cache-file. Everything else asks the daemon, unless it is deleted.
    #[instrument(name = "DavFs::getattr", skip(self, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn getattr(&self, node: &Arc<Node>, creds: &Credentials) -> Result<FileAttr, FsError> {
        let type_bits = if node.is_dir() { S_IFDIR } else { S_IFREG };
        let mut attr = FileAttr {
            ino: node.local_id(),
            kind: node.kind(),
            mode: 0o777 | type_bits,
            nlink: 1,
            uid: UNKNOWN_ID,
            gid: UNKNOWN_ID,
            size: node.size(),
            blocks: blocks_for(node.size()),
            blksize: BLOCK_SIZE,
            atime: node.times().atime,
            mtime: node.times().mtime,
            ctime: node.times().ctime,
        };

        let cached: Option<CacheAttrs> = match node.cache_file() {
            Some(cache) if node.is_file() => Some(cache.attributes().await?),
            _ => None,
        };
        let ask_server = match &cached {
            Some(cached) => {
                let unsettled = DownloadFlags::DOWNLOADING | DownloadFlags::DOWNLOAD_FAILED;
                cached.download.flags.intersects(unsettled) && !node.has(NodeStatus::DELETED)
            }
            None => !node.has(NodeStatus::DELETED),
        };

        let mut server_times = None;
        if ask_server {
            let reply: GetattrReply = self
                .transport
                .call(&ObjectRequest {
                    op: Op::Getattr,
                    creds: creds.clone(),
                    obj: node.remote_id(),
                })
                .await?
                .reply()?;
            attr.size = reply.attrs.size;
            attr.blocks = reply.blocks;
            attr.blksize = reply.blksize;
            server_times = Some(NodeTimes {
                atime: reply.attrs.atime,
                mtime: reply.attrs.mtime,
                ctime: reply.attrs.ctime,
            });
        } else if let Some(cached) = &cached {
            attr.size = cached.size;
            attr.blocks = blocks_for(cached.size);
        }

        match &cached {
            Some(cached) if node.has(NodeStatus::DIRTY) => {
                attr.atime = cached.atime;
                attr.mtime = cached.mtime;
                attr.ctime = cached.ctime;
            }
            Some(cached) if node.has(NodeStatus::ACCESSED) => attr.atime = cached.atime,
            Some(_) => {}
            // Unknown server times keep the node's own, stamped when it was created.
            None => {
                if let Some(times) = server_times.filter(NodeTimes::is_known) {
                    attr.atime = times.atime;
                    attr.mtime = times.mtime;
                    attr.ctime = times.ctime;
                }
            }
        }
        Ok(attr)
    }

    /// Applies size and time changes.
    ///
    /// Resizing a bound file waits for its download to finish first, since the
    /// background transfer would otherwise undo the change.
    #[instrument(name = "DavFs::setattr", skip(self, node, _creds), fields(remote_id = ?node.remote_id()))]
    pub async fn setattr(
        &self,
        node: &Arc<Node>,
        changes: SetAttr,
        _creds: &Credentials,
    ) -> Result<(), FsError> {
        if node.is_root() {
            return Err(Errno::EACCES.into());
        }
        let update = AttrUpdate {
            size: changes.size,
            atime: changes.atime,
            mtime: changes.mtime,
        };

        let Some(cache) = node.cache_file() else {
            debug!("no cache file, keeping times on the node");
            let mut times = node.times();
            times.atime = changes.atime.unwrap_or(times.atime);
            times.mtime = changes.mtime.unwrap_or(times.mtime);
            node.set_times(times);
            return Ok(());
        };

        let Some(size) = changes.size else {
            cache.set_attributes(update).await?;
            return Ok(());
        };
        if node.is_dir() {
            return Err(Errno::EISDIR.into());
        }

        let current = self
            .coherency
            .await_complete(&self.transport, node, cache.as_ref())
            .await?;
        if size != current.size || size != node.size() {
            node.mark_dirty();
        }
        cache.set_attributes(update).await?;
        node.set_size(size);
        self.host.set_size(node, size);
        Ok(())
    }
}
