//! Operation handlers: the POSIX-shaped entry points of one mount.
//!
//! Every handler takes the caller's [`Credentials`] and composes the identity
//! cache, the transport and the coherency coordinator with the host's generic
//! VFS layer. Handlers are grouped by concern:
//!
//! - [`namespace`]: lookup, create, mkdir, remove, rmdir, rename.
//! - [`file`]: open, close, mmap, mnomap, fsync.
//! - [`io`]: read, write, pagein, pageout.
//! - [`attr`]: getattr, setattr.
//! - [`dir`]: readdir.

use std::sync::Arc;

use bitflags::bitflags;
use nix::errno::Errno;
use tracing::{debug, info, instrument};

use crate::binding::BindingTable;
use crate::coherency::Coherency;
use crate::config::MountConfig;
use crate::error::FsError;
use crate::identity::IdentityCache;
use crate::node::{Node, NodeAttrs};
use crate::protocol::{Credentials, CredsRequest, Op};
use crate::transport::Transport;
use crate::vfs::VfsHost;

pub mod attr;
pub mod dir;
pub mod file;
pub mod io;
pub mod namespace;

pub use attr::{FileAttr, SetAttr};
pub use dir::ReadDir;
pub use namespace::{ComponentName, LookupIntent, LookupOutcome};

/// Ioctl command asking the daemon to drop all of its caches.
pub const INVALIDATE_CACHES_IOCTL: u64 = 0x2000_5701;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

bitflags! {
    /// Access mode an open session was granted with. Sent to the daemon as is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Names answered by [`DavFs::pathconf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathConfName {
    LinkMax,
    NameMax,
    PathMax,
    PipeBuf,
    ChownRestricted,
    NoTrunc,
    /// Anything else the host forwards; always EINVAL.
    Other(i32),
}

/// One mounted file system.
pub struct DavFs<V: VfsHost> {
    host: V,
    transport: Transport,
    identity: IdentityCache,
    bindings: BindingTable,
    coherency: Coherency,
    config: MountConfig,
    root: Arc<Node>,
}

impl<V: VfsHost> DavFs<V> {
    /// Sets up a mount and attaches its root node to the host.
    #[instrument(name = "DavFs::mount", skip_all, fields(socket = %config.socket_path.display()))]
    pub async fn mount(host: V, config: MountConfig, root_attrs: NodeAttrs) -> Result<Self, FsError> {
        let identity = IdentityCache::new();
        let root = identity.insert_root(config.root(), root_attrs);
        host.attach(&root).await?;
        info!(root = ?config.root(), "mounted");

        Ok(Self {
            transport: Transport::new(&config),
            coherency: Coherency::new(&config),
            bindings: BindingTable::new(),
            identity,
            host,
            config,
            root,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    #[must_use]
    pub fn host(&self) -> &V {
        &self.host
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityCache {
        &self.identity
    }

    /// Slots the daemon deposits opened cache-files into.
    #[must_use]
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// The host no longer references `node`: forget it.
    #[instrument(name = "DavFs::reclaim", skip_all, fields(remote_id = ?node.remote_id()))]
    pub fn reclaim(&self, node: &Arc<Node>) {
        if node.cache_file().is_some() {
            debug!("reclaiming a node that still holds its cache file");
        }
        self.identity.remove(node);
        self.host.cache_purge(node);
    }

    pub fn pathconf(&self, name: PathConfName) -> Result<i64, FsError> {
        let limits = &self.config.limits;
        let value = match name {
            PathConfName::LinkMax => limits.link_max,
            PathConfName::NameMax => limits.name_max,
            PathConfName::PathMax => limits.path_max,
            PathConfName::PipeBuf => limits.pipe_buf,
            PathConfName::ChownRestricted => i64::from(limits.chown_restricted),
            PathConfName::NoTrunc => i64::from(limits.no_trunc),
            PathConfName::Other(_) => -1,
        };
        if value < 0 {
            return Err(Errno::EINVAL.into());
        }
        Ok(value)
    }

    /// Dispatches an ioctl. Only [`INVALIDATE_CACHES_IOCTL`] is known.
    pub async fn ioctl(&self, command: u64, creds: &Credentials) -> Result<(), FsError> {
        if command != INVALIDATE_CACHES_IOCTL {
            return Err(Errno::EINVAL.into());
        }
        self.invalidate_caches(creds).await
    }

    #[instrument(name = "DavFs::invalidate_caches", skip_all)]
    pub async fn invalidate_caches(&self, creds: &Credentials) -> Result<(), FsError> {
        self.transport
            .call(&CredsRequest {
                op: Op::InvalidateCaches,
                creds: creds.clone(),
            })
            .await?
            .reply()
    }

    /// Tells the daemon the mount is going away.
    ///
    /// A forced unmount first fails every queued and in-flight call; UNMOUNT
    /// itself is still delivered.
    #[instrument(name = "DavFs::unmount", skip(self, creds))]
    pub async fn unmount(&self, force: bool, creds: &Credentials) -> Result<(), FsError> {
        if force {
            self.transport.force_unmount();
        }
        let result = self
            .transport
            .call(&CredsRequest {
                op: Op::Unmount,
                creds: creds.clone(),
            })
            .await
            .map_err(FsError::from)
            .and_then(|exchange| exchange.reply());
        self.transport.mark_unmounted();
        result
    }

    /// Publishes a size the cache-file grew to.
    fn sync_grown_size(&self, node: &Node, size: u64) {
        if node.size() < size {
            node.set_size(size);
            self.host.set_size(node, size);
        }
    }
}
