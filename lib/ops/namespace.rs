//! Name resolution and namespace mutation.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, instrument, trace};

use super::{DavFs, S_IFDIR, S_IFMT, S_IFREG};
use crate::error::FsError;
use crate::identity::NodeSpec;
use crate::node::{Node, NodeAttrs, NodeStatus, NodeTimes};
use crate::protocol::{
    CreateReply, CreateRequest, Credentials, LookupReply, LookupRequest, ObjectKind,
    ObjectRequest, Op, RenameRequest,
};
use crate::vfs::VfsHost;

/// What the caller means to do with the name it is resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupIntent {
    Lookup,
    Create,
    Delete,
    Rename,
}

/// One path component being resolved.
#[derive(Debug, Clone, Copy)]
pub struct ComponentName<'a> {
    pub name: &'a OsStr,
    pub intent: LookupIntent,
    /// Last component of the path.
    pub is_last: bool,
    /// Enter a successful result in the name-lookup cache.
    pub make_entry: bool,
}

impl<'a> ComponentName<'a> {
    /// A plain, cacheable lookup of a final component.
    #[must_use]
    pub fn new(name: &'a OsStr) -> Self {
        Self {
            name,
            intent: LookupIntent::Lookup,
            is_last: true,
            make_entry: true,
        }
    }

    #[must_use]
    pub fn with_intent(mut self, intent: LookupIntent) -> Self {
        self.intent = intent;
        self
    }

    fn is_dot(&self) -> bool {
        self.name.as_bytes() == b"."
    }

    fn is_dot_dot(&self) -> bool {
        self.name.as_bytes() == b".."
    }
}

/// Result of [`DavFs::lookup`].
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    Found(Arc<Node>),
    /// The last component does not exist but may be created or renamed onto.
    Creatable,
}

impl LookupOutcome {
    /// The resolved node, or ENOENT for [`LookupOutcome::Creatable`].
    pub fn into_node(self) -> Result<Arc<Node>, FsError> {
        match self {
            Self::Found(node) => Ok(node),
            Self::Creatable => Err(Errno::ENOENT.into()),
        }
    }
}

impl<V: VfsHost> DavFs<V> {
    /// Resolves `cn` inside `dir`.
    #[instrument(name = "DavFs::lookup", skip(self, dir, creds), fields(dir = ?dir.remote_id()))]
    pub async fn lookup(
        &self,
        dir: &Arc<Node>,
        cn: ComponentName<'_>,
        creds: &Credentials,
    ) -> Result<LookupOutcome, FsError> {
        let name_len = cn.name.as_bytes().len();
        if i64::try_from(name_len).unwrap_or(i64::MAX) > self.config.limits.name_max {
            return Err(Errno::ENAMETOOLONG.into());
        }
        if !dir.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        if cn.is_dot_dot() && dir.is_root() {
            debug!("'..' requested from the root");
            return Err(Errno::EIO.into());
        }
        if cn.is_last
            && self.config.read_only
            && matches!(cn.intent, LookupIntent::Delete | LookupIntent::Rename)
        {
            return Err(Errno::EROFS.into());
        }

        if let Some(node) = self.host.cache_lookup(dir, cn.name) {
            if !node.has(NodeStatus::DELETED) {
                trace!(local_id = node.local_id(), "name cache hit");
                return Ok(LookupOutcome::Found(node));
            }
        }

        if cn.is_dot() {
            if cn.is_last && cn.intent == LookupIntent::Rename {
                return Err(Errno::EISDIR.into());
            }
            return Ok(LookupOutcome::Found(Arc::clone(dir)));
        }
        if cn.is_dot_dot() {
            return dir
                .parent()
                .map(LookupOutcome::Found)
                .ok_or_else(|| Errno::ENOENT.into());
        }

        let reply = match self.remote_lookup(dir, cn.name, creds).await {
            Ok(reply) => reply,
            Err(e) if e.is_going_away() => return Err(e),
            Err(e) => {
                trace!(error = %e, "remote lookup failed");
                if cn.is_last && matches!(cn.intent, LookupIntent::Create | LookupIntent::Rename) {
                    return Ok(LookupOutcome::Creatable);
                }
                return Err(Errno::ENOENT.into());
            }
        };

        let (node, _) = self
            .identity
            .get_or_create(
                &self.host,
                NodeSpec {
                    remote_id: reply.obj,
                    kind: reply.attrs.kind,
                    parent: dir,
                    attrs: NodeAttrs {
                        size: reply.attrs.size,
                        times: NodeTimes {
                            atime: reply.attrs.atime,
                            mtime: reply.attrs.mtime,
                            ctime: reply.attrs.ctime,
                        }
                        .or_now(),
                    },
                },
            )
            .await?;
        if cn.make_entry {
            self.host.cache_enter(dir, cn.name, &node);
        }
        Ok(LookupOutcome::Found(node))
    }

    async fn remote_lookup(
        &self,
        dir: &Node,
        name: &OsStr,
        creds: &Credentials,
    ) -> Result<LookupReply, FsError> {
        self.transport
            .call(&LookupRequest {
                creds: creds.clone(),
                dir: dir.remote_id(),
                name: name.as_bytes().to_vec(),
            })
            .await?
            .reply()
    }

    /// Creates a regular file. `mode` carries the file type bits.
    #[instrument(name = "DavFs::create", skip(self, dir, creds), fields(dir = ?dir.remote_id()))]
    pub async fn create(
        &self,
        dir: &Arc<Node>,
        name: &OsStr,
        mode: u32,
        creds: &Credentials,
    ) -> Result<Arc<Node>, FsError> {
        if mode & S_IFMT != S_IFREG {
            return Err(Errno::ENOTSUP.into());
        }
        self.make_object(Op::Create, dir, name, mode, creds).await
    }

    /// Creates a directory. `mode` carries the file type bits.
    #[instrument(name = "DavFs::mkdir", skip(self, dir, creds), fields(dir = ?dir.remote_id()))]
    pub async fn mkdir(
        &self,
        dir: &Arc<Node>,
        name: &OsStr,
        mode: u32,
        creds: &Credentials,
    ) -> Result<Arc<Node>, FsError> {
        if mode & S_IFMT != S_IFDIR {
            return Err(Errno::ENOTDIR.into());
        }
        self.make_object(Op::Mkdir, dir, name, mode, creds).await
    }

    async fn make_object(
        &self,
        op: Op,
        dir: &Arc<Node>,
        name: &OsStr,
        mode: u32,
        creds: &Credentials,
    ) -> Result<Arc<Node>, FsError> {
        let reply: CreateReply = self
            .transport
            .call(&CreateRequest {
                op,
                creds: creds.clone(),
                dir: dir.remote_id(),
                mode,
                name: name.as_bytes().to_vec(),
            })
            .await?
            .reply()?;

        dir.insert_status(NodeStatus::DIRECTORY_STALE);

        let (kind, size) = match op {
            Op::Mkdir => (ObjectKind::Directory, self.config.dir_size),
            _ => (ObjectKind::File, 0),
        };
        let (node, _) = self
            .identity
            .get_or_create(
                &self.host,
                NodeSpec {
                    remote_id: reply.obj,
                    kind,
                    parent: dir,
                    attrs: NodeAttrs {
                        size,
                        times: NodeTimes::now(),
                    },
                },
            )
            .await
            .inspect_err(|e| debug!(error = %e, "created on the server but not attached"))?;
        self.host.cache_enter(dir, name, &node);
        Ok(node)
    }

    /// Removes the file `node` from `dir`.
    ///
    /// With `no_delete_busy`, a file that is still open fails EBUSY.
    #[instrument(name = "DavFs::remove", skip(self, dir, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn remove(
        &self,
        dir: &Arc<Node>,
        node: &Arc<Node>,
        no_delete_busy: bool,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        if node.is_dir() {
            return Err(Errno::EPERM.into());
        }
        if no_delete_busy && node.open_count() > 0 {
            return Err(Errno::EBUSY.into());
        }
        self.unlink(Op::Remove, dir, node, creds).await
    }

    #[instrument(name = "DavFs::rmdir", skip(self, dir, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn rmdir(
        &self,
        dir: &Arc<Node>,
        node: &Arc<Node>,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        if Arc::ptr_eq(dir, node) {
            return Err(Errno::EINVAL.into());
        }
        if !node.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        self.unlink(Op::Rmdir, dir, node, creds).await
    }

    async fn unlink(
        &self,
        op: Op,
        dir: &Arc<Node>,
        node: &Arc<Node>,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        self.host.cache_purge(node);
        self.transport
            .call(&ObjectRequest {
                op,
                creds: creds.clone(),
                obj: node.remote_id(),
            })
            .await?
            .reply::<()>()?;

        node.insert_status(NodeStatus::DELETED);
        dir.insert_status(NodeStatus::DIRECTORY_STALE);
        self.host.recycle(node);
        Ok(())
    }

    /// Renames `from` in `from_dir` to `to_name` in `to_dir`, replacing `to`.
    ///
    /// A replaced node is marked deleted and purged whether or not the server
    /// accepted the rename, and both directories are marked stale.
    #[instrument(
        name = "DavFs::rename",
        skip(self, from_dir, from, to_dir, to, creds),
        fields(from = ?from.remote_id(), to = ?to.map(|n| n.remote_id()))
    )]
    pub async fn rename(
        &self,
        from_dir: &Arc<Node>,
        from: &Arc<Node>,
        to_dir: &Arc<Node>,
        to: Option<&Arc<Node>>,
        to_name: &OsStr,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        self.host.cache_purge(from);

        let result = match self
            .transport
            .call(&RenameRequest {
                creds: creds.clone(),
                from_dir: from_dir.remote_id(),
                from_obj: from.remote_id(),
                to_dir: to_dir.remote_id(),
                to_obj: to.map(|n| n.remote_id()),
                to_name: to_name.as_bytes().to_vec(),
            })
            .await
        {
            Ok(exchange) => exchange.reply::<()>(),
            Err(e) => Err(e.into()),
        };

        if let Some(target) = to {
            if !Arc::ptr_eq(target, from) {
                self.host.cache_purge(target);
                target.insert_status(NodeStatus::DELETED);
                if result.is_ok() {
                    self.host.recycle(target);
                }
            }
        }
        from_dir.insert_status(NodeStatus::DIRECTORY_STALE);
        to_dir.insert_status(NodeStatus::DIRECTORY_STALE);

        if result.is_ok() {
            from.set_parent(to_dir);
        }
        result
    }
}
