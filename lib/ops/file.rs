//! Open sessions, mappings and flushing.

use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, instrument, warn};

use super::{DavFs, OpenFlags};
use crate::error::FsError;
use crate::node::{Node, NodeStatus};
use crate::protocol::{Credentials, ObjectRequest, Op, OpenReply, OpenRequest};
use crate::vfs::VfsHost;

impl<V: VfsHost> DavFs<V> {
    /// Opens a session on `node`.
    ///
    /// A node that already holds a cache-file only gains one more session.
    /// Otherwise the daemon is asked to open a cache-file and deposit it.
    #[instrument(name = "DavFs::open", skip(self, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn open(
        &self,
        node: &Arc<Node>,
        flags: OpenFlags,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        if join_session(node)? {
            return Ok(());
        }
        // First opens of one node queue here so the daemon grants one binding.
        let _first = node.open_gate().lock().await;
        if join_session(node)? {
            return Ok(());
        }

        let slot = self.bindings.assign();
        let reply: OpenReply = self
            .transport
            .call(&OpenRequest {
                creds: creds.clone(),
                obj: node.remote_id(),
                flags: flags.bits(),
                binding: slot.id(),
            })
            .await?
            .reply()?;

        let deposit = match slot.take() {
            Some(deposit) if deposit.pid == reply.pid => deposit,
            Some(deposit) => {
                return Err(FsError::integrity(
                    Errno::EPERM,
                    format!(
                        "cache file deposited by pid {} but daemon reported pid {}",
                        deposit.pid, reply.pid
                    ),
                ));
            }
            None => {
                return Err(FsError::integrity(
                    Errno::EPERM,
                    format!("daemon pid {} reported an open but deposited nothing", reply.pid),
                ));
            }
        };

        if !node.bind(deposit.file) {
            return Err(Errno::ENFILE.into());
        }
        if node.is_dir() {
            node.insert_status(NodeStatus::DIRECTORY_STALE);
        }
        Ok(())
    }

    /// Ends one session. `flags` are the ones the session was opened with.
    #[instrument(name = "DavFs::close", skip(self, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn close(
        &self,
        node: &Arc<Node>,
        flags: OpenFlags,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        let force_flush = flags.contains(OpenFlags::WRITE) && node.is_file();
        node.release_open();
        self.close_or_unmap(node, force_flush, creds).await
    }

    #[instrument(name = "DavFs::mmap", skip_all, fields(remote_id = ?node.remote_id()))]
    pub fn mmap(&self, node: &Node) {
        node.insert_status(NodeStatus::MEMORY_MAPPED | NodeStatus::WAS_MEMORY_MAPPED);
    }

    /// The last mapping went away. Closes the node if no session is left.
    #[instrument(name = "DavFs::mnomap", skip(self, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn mnomap(&self, node: &Arc<Node>, creds: &Credentials) -> Result<(), FsError> {
        node.remove_status(NodeStatus::MEMORY_MAPPED);
        self.close_or_unmap(node, false, creds).await
    }

    /// Pushes the node's body to the server if it is dirty.
    #[instrument(name = "DavFs::fsync", skip(self, node, creds), fields(remote_id = ?node.remote_id()))]
    pub async fn fsync(&self, node: &Arc<Node>, creds: &Credentials) -> Result<(), FsError> {
        match node.cache_file() {
            Some(cache) if node.is_file() => {
                self.coherency
                    .flush(&self.host, &self.transport, node, cache.as_ref(), creds)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn close_or_unmap(
        &self,
        node: &Arc<Node>,
        force_flush: bool,
        creds: &Credentials,
    ) -> Result<(), FsError> {
        let Some(cache) = node.cache_file() else {
            debug!("closing a node without a cache file");
            return Ok(());
        };

        let flushed = if node.is_file() && (force_flush || node.open_count() == 0) {
            self.coherency
                .flush(&self.host, &self.transport, node, cache.as_ref(), creds)
                .await
        } else {
            Ok(())
        };
        drop(cache);

        let released = match node.unbind_if_idle() {
            Some(cache) => {
                let result = self
                    .transport
                    .call(&ObjectRequest {
                        op: Op::Close,
                        creds: creds.clone(),
                        obj: node.remote_id(),
                    })
                    .await
                    .map_err(FsError::from)
                    .and_then(|exchange| exchange.reply::<()>());
                drop(cache);
                result
            }
            None => Ok(()),
        };

        match (flushed, released) {
            (Err(flush), Err(close)) => {
                warn!(flush = %flush, close = %close, "flush and close both failed");
                if close.is_going_away() {
                    Err(close)
                } else {
                    Err(flush)
                }
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

/// Adds a session to a node that is already bound. `Ok(false)` means the
/// node has no binding yet.
fn join_session(node: &Node) -> Result<bool, FsError> {
    match node.reopen() {
        Some(true) => {
            if node.is_dir() {
                node.insert_status(NodeStatus::DIRECTORY_STALE);
            }
            Ok(true)
        }
        Some(false) => Err(Errno::ENFILE.into()),
        None => Ok(false),
    }
}
