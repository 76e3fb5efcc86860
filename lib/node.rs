//! Local node descriptors.

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::cache_file::CacheFile;
use crate::protocol::{ObjectKind, RemoteId};

/// Locally assigned node number, visible to callers as the inode number.
pub type LocalId = u64;

bitflags! {
    /// Per-node status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeStatus: u32 {
        /// Still being constructed; invisible to lookups.
        const INITIALIZING      = 1 << 0;
        /// Someone is blocked waiting for `INITIALIZING` to clear.
        const WAIT_FOR_INIT     = 1 << 1;
        /// The cache-file holds bytes the server has not seen.
        const DIRTY             = 1 << 2;
        /// Removed on the server. Permanent.
        const DELETED           = 1 << 3;
        /// Currently memory mapped.
        const MEMORY_MAPPED     = 1 << 4;
        /// Was memory mapped at some point. Sticky.
        const WAS_MEMORY_MAPPED = 1 << 5;
        /// Read since it was last opened.
        const ACCESSED          = 1 << 6;
        /// Directory listing must be refreshed from the server.
        const DIRECTORY_STALE   = 1 << 7;
    }
}

/// Access, modification and change times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTimes {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl NodeTimes {
    #[must_use]
    pub fn now() -> Self {
        Self::all(SystemTime::now())
    }

    #[must_use]
    pub fn all(time: SystemTime) -> Self {
        Self {
            atime: time,
            mtime: time,
            ctime: time,
        }
    }

    /// The server reports an access time at the epoch when it has none.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.atime != UNIX_EPOCH
    }

    /// `self` if known, otherwise the current time.
    #[must_use]
    pub fn or_now(self) -> Self {
        if self.is_known() { self } else { Self::now() }
    }
}

/// Metadata a node is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttrs {
    pub size: u64,
    pub times: NodeTimes,
}

struct NodeState {
    status: NodeStatus,
    open_count: u32,
    binding: Option<Arc<dyn CacheFile>>,
    size: u64,
    times: NodeTimes,
    /// Bumped on every write so a flush can tell whether it raced one.
    write_epoch: u64,
    parent: Weak<Node>,
}

/// One live file-system object bound to a remote identifier.
///
/// All mutable state sits behind a short-lived lock; nothing here is held
/// across an await point.
pub struct Node {
    remote_id: RemoteId,
    local_id: LocalId,
    kind: ObjectKind,
    is_root: bool,
    state: Mutex<NodeState>,
    /// Held by a first open for the whole daemon round-trip.
    open_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("remote_id", &self.remote_id)
            .field("local_id", &self.local_id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Node {
    pub(crate) fn new(
        remote_id: RemoteId,
        local_id: LocalId,
        kind: ObjectKind,
        parent: Option<&Arc<Self>>,
        attrs: NodeAttrs,
        status: NodeStatus,
    ) -> Self {
        Self {
            remote_id,
            local_id,
            kind,
            is_root: parent.is_none(),
            state: Mutex::new(NodeState {
                status,
                open_count: 0,
                binding: None,
                size: attrs.size,
                times: attrs.times,
                write_epoch: 0,
                parent: parent.map_or_else(Weak::new, Arc::downgrade),
            }),
            open_gate: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    #[must_use]
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == ObjectKind::File
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// The containing directory, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.state.lock().parent.upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Self>) {
        self.state.lock().parent = Arc::downgrade(parent);
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn has(&self, flags: NodeStatus) -> bool {
        self.state.lock().status.contains(flags)
    }

    pub(crate) fn insert_status(&self, flags: NodeStatus) {
        self.state.lock().status.insert(flags);
    }

    pub(crate) fn remove_status(&self, flags: NodeStatus) {
        self.state.lock().status.remove(flags);
    }

    /// Best-known size of the body.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    #[must_use]
    pub fn times(&self) -> NodeTimes {
        self.state.lock().times
    }

    pub(crate) fn set_times(&self, times: NodeTimes) {
        self.state.lock().times = times;
    }

    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    /// The bound cache-file, if the node has been opened.
    #[must_use]
    pub fn cache_file(&self) -> Option<Arc<dyn CacheFile>> {
        self.state.lock().binding.clone()
    }

    /// Adds one open session to an already bound node.
    ///
    /// Returns `None` when the node has no binding, and `Some(false)` when the
    /// count would wrap.
    pub(crate) fn reopen(&self) -> Option<bool> {
        let mut state = self.state.lock();
        state.binding.as_ref()?;
        match state.open_count.checked_add(1) {
            Some(count) => {
                state.open_count = count;
                Some(true)
            }
            None => Some(false),
        }
    }

    pub(crate) fn open_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.open_gate
    }

    /// Installs a freshly granted binding with one open session.
    ///
    /// A node that is already bound keeps its binding and only gains a
    /// session. Returns `false` when the count would wrap.
    pub(crate) fn bind(&self, file: Arc<dyn CacheFile>) -> bool {
        let mut state = self.state.lock();
        if state.binding.is_none() {
            state.binding = Some(file);
            state.open_count = 1;
            return true;
        }
        match state.open_count.checked_add(1) {
            Some(count) => {
                state.open_count = count;
                true
            }
            None => false,
        }
    }

    /// Drops one open session and returns the remaining count.
    pub(crate) fn release_open(&self) -> u32 {
        let mut state = self.state.lock();
        state.open_count = state.open_count.saturating_sub(1);
        state.open_count
    }

    /// Drops the binding if the node is neither open nor mapped.
    pub(crate) fn unbind_if_idle(&self) -> Option<Arc<dyn CacheFile>> {
        let mut state = self.state.lock();
        if state.open_count == 0 && !state.status.contains(NodeStatus::MEMORY_MAPPED) {
            state.binding.take()
        } else {
            None
        }
    }

    /// Marks the node dirty and returns the new write epoch.
    pub(crate) fn mark_dirty(&self) -> u64 {
        let mut state = self.state.lock();
        state.status.insert(NodeStatus::DIRTY);
        state.write_epoch += 1;
        state.write_epoch
    }

    pub(crate) fn write_epoch(&self) -> u64 {
        self.state.lock().write_epoch
    }

    /// Clears DIRTY unless a write landed after `epoch` was sampled.
    pub(crate) fn clear_dirty_since(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.write_epoch == epoch {
            state.status.remove(NodeStatus::DIRTY);
            true
        } else {
            false
        }
    }
}
