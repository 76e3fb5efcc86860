//! Interface to the host's generic VFS and page-cache layer.
//!
//! The host owns generic node objects, the name-lookup cache and the page
//! cache. The handlers drive it through [`VfsHost`] and never reimplement it.

use std::ffi::OsStr;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::FsError;
use crate::node::Node;

/// Page granularity of [`PageList`]s.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// Flags accompanying a pagein/pageout request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// The caller commits or aborts the pages itself.
        const NO_COMMIT = 1 << 0;
    }
}

/// A run of pages over a byte range of one node.
pub trait PageList: Send {
    fn page_count(&self) -> usize;

    /// Whether page `index` already holds valid data.
    fn is_resident(&self, index: usize) -> bool;

    /// Copies bytes out of the pages, `offset` counted from the list start.
    fn read(&self, offset: usize, buf: &mut [u8]);

    /// Copies bytes into the pages, `offset` counted from the list start.
    fn write(&mut self, offset: usize, data: &[u8]);

    fn commit(&mut self);

    /// Gives the pages back. `failed` marks them as errored.
    fn abort(&mut self, failed: bool);
}

impl<P: PageList + ?Sized> PageList for &mut P {
    fn page_count(&self) -> usize {
        (**self).page_count()
    }

    fn is_resident(&self, index: usize) -> bool {
        (**self).is_resident(index)
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        (**self).read(offset, buf);
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        (**self).write(offset, data);
    }

    fn commit(&mut self) {
        (**self).commit();
    }

    fn abort(&mut self, failed: bool) {
        (**self).abort(failed);
    }
}

/// Aborts the wrapped pages as failed unless settled first.
pub(crate) struct PageListGuard<P: PageList> {
    pages: P,
    settled: bool,
}

impl<P: PageList> PageListGuard<P> {
    pub(crate) fn new(pages: P) -> Self {
        Self {
            pages,
            settled: false,
        }
    }

    pub(crate) fn pages(&mut self) -> &mut P {
        &mut self.pages
    }

    pub(crate) fn commit(mut self) {
        self.settled = true;
        self.pages.commit();
    }

    pub(crate) fn abort(mut self, failed: bool) {
        self.settled = true;
        self.pages.abort(failed);
    }
}

impl<P: PageList> Drop for PageListGuard<P> {
    fn drop(&mut self) {
        if !self.settled {
            self.pages.abort(true);
        }
    }
}

/// A maximal run of pages with the same residency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRun {
    pub pages: Range<usize>,
    pub resident: bool,
}

/// Partitions `pages` into maximal resident / non-resident runs.
pub fn page_runs(pages: &impl PageList) -> Vec<PageRun> {
    let mut runs: Vec<PageRun> = Vec::new();
    for index in 0..pages.page_count() {
        let resident = pages.is_resident(index);
        match runs.last_mut() {
            Some(run) if run.resident == resident => run.pages.end = index + 1,
            _ => runs.push(PageRun {
                pages: index..index + 1,
                resident,
            }),
        }
    }
    runs
}

/// The host's generic VFS layer.
pub trait VfsHost: Send + Sync {
    type Pages: PageList;

    /// Bind a freshly constructed node to a generic host node. May block.
    fn attach(&self, node: &Arc<Node>) -> impl Future<Output = Result<(), FsError>> + Send;

    /// Add `dir/name -> node` to the name-lookup cache.
    fn cache_enter(&self, dir: &Arc<Node>, name: &OsStr, node: &Arc<Node>);

    fn cache_lookup(&self, dir: &Arc<Node>, name: &OsStr) -> Option<Arc<Node>>;

    /// Drop every name-lookup cache entry that resolves to `node`.
    fn cache_purge(&self, node: &Arc<Node>);

    /// Ask the host to reclaim `node` as soon as it is unreferenced.
    fn recycle(&self, node: &Arc<Node>);

    /// Tell the page cache the node's size changed.
    fn set_size(&self, node: &Node, size: u64);

    /// Page list over `len` bytes of `node` starting at page-aligned `offset`.
    fn page_list(&self, node: &Arc<Node>, offset: u64, len: usize) -> Result<Self::Pages, FsError>;

    /// Push dirty mapped pages in `range` back into the bound cache-file.
    fn sync_range(
        &self,
        node: &Arc<Node>,
        range: Range<u64>,
    ) -> impl Future<Output = Result<(), FsError>> + Send;
}
