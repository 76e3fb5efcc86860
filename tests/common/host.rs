//! In-memory stand-ins for the host VFS layer and for cache-files.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use dav_fs::FsError;
use dav_fs::cache_file::{AttrUpdate, CacheAttrs, CacheFile, DownloadSignal};
use dav_fs::node::{LocalId, Node};
use dav_fs::vfs::{PAGE_SIZE, PageList, VfsHost};

/// A cache-file held in memory. Tests play the background download agent by
/// appending bytes and publishing through the signal.
pub struct MemoryCacheFile {
    data: Mutex<Vec<u8>>,
    times: Mutex<(SystemTime, SystemTime, SystemTime)>,
    signal: DownloadSignal,
}

impl MemoryCacheFile {
    /// A fully downloaded body.
    pub fn complete(body: &[u8]) -> Arc<Self> {
        Self::with_signal(body, DownloadSignal::complete())
    }

    /// A body of which only `present` has arrived so far.
    pub fn downloading(present: &[u8]) -> Arc<Self> {
        Self::with_signal(present, DownloadSignal::downloading())
    }

    fn with_signal(body: &[u8], signal: DownloadSignal) -> Arc<Self> {
        let now = SystemTime::now();
        Arc::new(Self {
            data: Mutex::new(body.to_vec()),
            times: Mutex::new((now, now, now)),
            signal,
        })
    }

    /// More of the body arrived.
    pub fn append(&self, more: &[u8]) {
        self.data.lock().unwrap().extend_from_slice(more);
        self.signal.progressed();
    }

    pub fn finish(&self) {
        self.signal.finish();
    }

    pub fn fail(&self) {
        self.signal.fail();
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Replaces the whole body, the way the daemon rewrites directory listings.
    pub fn replace(&self, body: &[u8]) {
        *self.data.lock().unwrap() = body.to_vec();
    }
}

#[async_trait]
impl CacheFile for MemoryCacheFile {
    fn download(&self) -> &DownloadSignal {
        &self.signal
    }

    async fn attributes(&self) -> std::io::Result<CacheAttrs> {
        let (atime, mtime, ctime) = *self.times.lock().unwrap();
        Ok(CacheAttrs {
            size: self.data.lock().unwrap().len() as u64,
            atime,
            mtime,
            ctime,
            download: self.signal.snapshot(),
        })
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let data = self.data.lock().unwrap();
        let start = usize::try_from(offset).unwrap().min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, bytes: &[u8], offset: u64) -> std::io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        let start = usize::try_from(offset).unwrap();
        if data.len() < start + bytes.len() {
            data.resize(start + bytes.len(), 0);
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        self.times.lock().unwrap().1 = SystemTime::now();
        Ok(bytes.len())
    }

    async fn set_attributes(&self, update: AttrUpdate) -> std::io::Result<()> {
        if let Some(size) = update.size {
            self.data
                .lock()
                .unwrap()
                .resize(usize::try_from(size).unwrap(), 0);
        }
        let mut times = self.times.lock().unwrap();
        if let Some(atime) = update.atime {
            times.0 = atime;
        }
        if let Some(mtime) = update.mtime {
            times.1 = mtime;
        }
        Ok(())
    }
}

/// What happened to a page list once the handler let go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Committed,
    Aborted { failed: bool },
}

/// Resident pages of every node, keyed by node and page index.
type PageCache = Mutex<HashMap<(LocalId, u64), Vec<u8>>>;

/// Where a page list's resident pages go back to once it is settled.
struct WriteBack {
    cache: Arc<PageCache>,
    node: LocalId,
    first_page: u64,
}

/// A page list backed by a plain buffer.
pub struct MemoryPages {
    pub bytes: Vec<u8>,
    pub resident: Vec<bool>,
    pub settled: Option<Settled>,
    write_back: Option<WriteBack>,
}

impl MemoryPages {
    /// `pages` non-resident pages filled with `fill`.
    pub fn new(pages: usize, fill: u8) -> Self {
        Self {
            bytes: vec![fill; pages * PAGE_SIZE],
            resident: vec![false; pages],
            settled: None,
            write_back: None,
        }
    }

    fn settle(&mut self, settled: Settled) {
        self.settled = Some(settled);
        let Some(back) = &self.write_back else {
            return;
        };
        let mut cache = back.cache.lock().unwrap();
        for (index, page) in self.bytes.chunks_exact(PAGE_SIZE).enumerate() {
            if self.resident[index] {
                cache.insert((back.node, back.first_page + index as u64), page.to_vec());
            }
        }
    }
}

impl PageList for MemoryPages {
    fn page_count(&self) -> usize {
        self.resident.len()
    }

    fn is_resident(&self, index: usize) -> bool {
        self.resident[index]
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn commit(&mut self) {
        self.settle(Settled::Committed);
    }

    fn abort(&mut self, failed: bool) {
        self.settle(Settled::Aborted { failed });
    }
}

/// Host VFS with a name cache and counters for every interaction.
#[derive(Default)]
pub struct MemoryVfs {
    names: Mutex<HashMap<(LocalId, OsString), Arc<Node>>>,
    recycled: Mutex<Vec<LocalId>>,
    sizes: Mutex<HashMap<LocalId, u64>>,
    pages: Arc<PageCache>,
    attaches: AtomicUsize,
    syncs: AtomicUsize,
}

impl MemoryVfs {
    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn was_recycled(&self, node: &Node) -> bool {
        self.recycled.lock().unwrap().contains(&node.local_id())
    }

    /// Size last pushed to the page cache for `node`.
    pub fn published_size(&self, node: &Node) -> Option<u64> {
        self.sizes.lock().unwrap().get(&node.local_id()).copied()
    }

    /// Makes page `index` of `node` resident with `bytes`, zero padded.
    pub fn cache_page(&self, node: &Node, index: u64, bytes: &[u8]) {
        let mut page = bytes.to_vec();
        page.resize(PAGE_SIZE, 0);
        self.pages
            .lock()
            .unwrap()
            .insert((node.local_id(), index), page);
    }

    /// Contents of a resident page.
    pub fn cached_page(&self, node: &Node, index: u64) -> Option<Vec<u8>> {
        self.pages
            .lock()
            .unwrap()
            .get(&(node.local_id(), index))
            .cloned()
    }

    pub fn cached_name(&self, dir: &Node, name: &str) -> Option<Arc<Node>> {
        self.names
            .lock()
            .unwrap()
            .get(&(dir.local_id(), OsString::from(name)))
            .cloned()
    }
}

impl VfsHost for MemoryVfs {
    type Pages = MemoryPages;

    async fn attach(&self, _node: &Arc<Node>) -> Result<(), FsError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cache_enter(&self, dir: &Arc<Node>, name: &OsStr, node: &Arc<Node>) {
        self.names
            .lock()
            .unwrap()
            .insert((dir.local_id(), name.to_owned()), Arc::clone(node));
    }

    fn cache_lookup(&self, dir: &Arc<Node>, name: &OsStr) -> Option<Arc<Node>> {
        self.names
            .lock()
            .unwrap()
            .get(&(dir.local_id(), name.to_owned()))
            .cloned()
    }

    fn cache_purge(&self, node: &Arc<Node>) {
        self.names
            .lock()
            .unwrap()
            .retain(|_, cached| !Arc::ptr_eq(cached, node));
    }

    fn recycle(&self, node: &Arc<Node>) {
        self.recycled.lock().unwrap().push(node.local_id());
    }

    fn set_size(&self, node: &Node, size: u64) {
        self.sizes.lock().unwrap().insert(node.local_id(), size);
    }

    fn page_list(
        &self,
        node: &Arc<Node>,
        offset: u64,
        len: usize,
    ) -> Result<MemoryPages, FsError> {
        let first_page = offset / PAGE_SIZE as u64;
        let mut pages = MemoryPages::new(len.div_ceil(PAGE_SIZE), 0);
        let cache = self.pages.lock().unwrap();
        for index in 0..pages.resident.len() {
            if let Some(page) = cache.get(&(node.local_id(), first_page + index as u64)) {
                pages.bytes[index * PAGE_SIZE..(index + 1) * PAGE_SIZE].copy_from_slice(page);
                pages.resident[index] = true;
            }
        }
        drop(cache);
        pages.write_back = Some(WriteBack {
            cache: Arc::clone(&self.pages),
            node: node.local_id(),
            first_page,
        });
        Ok(pages)
    }

    async fn sync_range(&self, _node: &Arc<Node>, _range: Range<u64>) -> Result<(), FsError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
