//! Identity cache: at most one [`Node`] per remote identifier.
//!
//! Entries move from `Initializing` to `Ready`. The creator of an entry is the
//! only task that attaches it to the host; everyone else asking for the same
//! identifier parks on the entry's channel until the creator finishes or fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use scc::HashMap as ConcurrentHashMap;
use scc::hash_map::Entry;
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::error::FsError;
use crate::node::{LocalId, Node, NodeAttrs, NodeStatus};
use crate::protocol::{ObjectKind, RemoteId};
use crate::vfs::VfsHost;

/// Local id of the mount root.
pub const ROOT_LOCAL_ID: LocalId = 1;

enum Slot {
    /// Being attached. The channel closes when the creator is done either way.
    Initializing {
        node: Arc<Node>,
        ready: watch::Receiver<()>,
    },
    Ready(Arc<Node>),
}

/// What to build when an identifier is not cached yet.
#[derive(Debug, Clone, Copy)]
pub struct NodeSpec<'a> {
    pub remote_id: RemoteId,
    pub kind: ObjectKind,
    pub parent: &'a Arc<Node>,
    pub attrs: NodeAttrs,
}

/// Whether [`IdentityCache::get_or_create`] found or built the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cached,
    Created,
}

/// Removes an `Initializing` entry unless defused, so a cancelled or failed
/// creator never strands its waiters. Waiters wake when `_ready` drops, which
/// happens after the entry is gone.
struct InitGuard<'a> {
    table: &'a ConcurrentHashMap<RemoteId, Slot>,
    remote_id: RemoteId,
    armed: bool,
    _ready: watch::Sender<()>,
}

impl InitGuard<'_> {
    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!(remote_id = ?self.remote_id, "abandoning initializing entry");
            self.table
                .remove_if_sync(&self.remote_id, |slot| {
                    matches!(slot, Slot::Initializing { .. })
                });
        }
    }
}

/// Concurrent map from remote identifier to live node.
pub struct IdentityCache {
    table: ConcurrentHashMap<RemoteId, Slot>,
    next_local_id: AtomicU64,
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ConcurrentHashMap::new(),
            next_local_id: AtomicU64::new(ROOT_LOCAL_ID + 1),
        }
    }

    /// Install the mount root. It has no parent and is never initializing.
    pub fn insert_root(&self, remote_id: RemoteId, attrs: NodeAttrs) -> Arc<Node> {
        let root = Arc::new(Node::new(
            remote_id,
            ROOT_LOCAL_ID,
            ObjectKind::Directory,
            None,
            attrs,
            NodeStatus::empty(),
        ));
        self.table
            .upsert_sync(remote_id, Slot::Ready(Arc::clone(&root)));
        root
    }

    /// Number of entries, initializing ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The ready node for `remote_id`, without waiting.
    #[must_use]
    pub fn get(&self, remote_id: RemoteId) -> Option<Arc<Node>> {
        self.table
            .read_sync(&remote_id, |_, slot| match slot {
                Slot::Ready(node) => Some(Arc::clone(node)),
                Slot::Initializing { .. } => None,
            })
            .flatten()
    }

    fn allocate_local_id(&self) -> LocalId {
        self.next_local_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the node for `wanted.remote_id`, building and attaching it if absent.
    ///
    /// Concurrent callers for the same identifier share one construction.
    /// A cached node that has been deleted is replaced rather than returned.
    #[instrument(name = "IdentityCache::get_or_create", skip(self, host, wanted), fields(remote_id = ?wanted.remote_id))]
    pub async fn get_or_create<V: VfsHost>(
        &self,
        host: &V,
        wanted: NodeSpec<'_>,
    ) -> Result<(Arc<Node>, Origin), FsError> {
        loop {
            match self.table.entry_async(wanted.remote_id).await {
                Entry::Occupied(occ) => match occ.get() {
                    Slot::Ready(node) if !node.has(NodeStatus::DELETED) => {
                        return Ok((Arc::clone(node), Origin::Cached));
                    }
                    Slot::Ready(_) => {
                        debug!("replacing a deleted node");
                        drop(occ.remove_entry());
                    }
                    Slot::Initializing { node, ready } => {
                        node.insert_status(NodeStatus::WAIT_FOR_INIT);
                        let mut ready = ready.clone();
                        drop(occ); // release the shard lock before awaiting
                        // Err means the creator dropped its sender: done either way.
                        let _ = ready.changed().await;
                    }
                },
                Entry::Vacant(vac) => {
                    let node = Arc::new(Node::new(
                        wanted.remote_id,
                        self.allocate_local_id(),
                        wanted.kind,
                        Some(wanted.parent),
                        wanted.attrs,
                        NodeStatus::INITIALIZING,
                    ));
                    let (tx, rx) = watch::channel(());
                    vac.insert_entry(Slot::Initializing {
                        node: Arc::clone(&node),
                        ready: rx,
                    });
                    let mut guard = InitGuard {
                        table: &self.table,
                        remote_id: wanted.remote_id,
                        armed: true,
                        _ready: tx,
                    };

                    host.attach(&node).await?;

                    node.remove_status(NodeStatus::INITIALIZING | NodeStatus::WAIT_FOR_INIT);
                    self.table
                        .upsert_async(wanted.remote_id, Slot::Ready(Arc::clone(&node)))
                        .await;
                    guard.defuse();
                    trace!(local_id = node.local_id(), "node attached");
                    return Ok((node, Origin::Created));
                }
            }
        }
    }

    /// Drop `node` from the table if it is still the entry for its identifier.
    pub fn remove(&self, node: &Arc<Node>) -> bool {
        self.table
            .remove_if_sync(&node.remote_id(), |slot| {
                matches!(slot, Slot::Ready(current) if Arc::ptr_eq(current, node))
            })
            .is_some()
    }
}
