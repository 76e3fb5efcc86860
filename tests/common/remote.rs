//! A small in-memory server tree answering daemon requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use dav_fs::cache_file::CacheFile;
use dav_fs::protocol::{
    CreateReply, CreateRequest, DirRecord, GetattrReply, LookupReply, LookupRequest, ObjectKind,
    ObjectRequest, Op, OpenReply, OpenRequest, ReadBytesRequest, ReaddirRequest, RemoteAttrs,
    RemoteId, RenameRequest, Reply as _, RequestFrame,
};

use super::daemon::{Backchannel, DAEMON_PID};
use super::host::MemoryCacheFile;

pub const ROOT: RemoteId = RemoteId(1);

/// Modification time every object reports.
pub fn server_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

struct Object {
    kind: ObjectKind,
    parent: RemoteId,
    name: Vec<u8>,
    /// Authoritative body, served by READ-BYTES.
    body: Vec<u8>,
    /// Cache-file handed out on OPEN.
    file: Arc<MemoryCacheFile>,
    /// Reported times are the epoch when unset.
    times_known: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    objects: HashMap<RemoteId, Object>,
    failures: HashMap<Op, u32>,
}

/// Server-side object tree. Status words are plain errnos.
pub struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let mut state = State {
            next_id: ROOT.0 + 1,
            ..State::default()
        };
        state.objects.insert(
            ROOT,
            Object {
                kind: ObjectKind::Directory,
                parent: ROOT,
                name: Vec::new(),
                body: Vec::new(),
                file: MemoryCacheFile::complete(&[]),
                times_known: true,
            },
        );
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Adds a file whose cache-file is already complete.
    pub fn add_file(&self, parent: RemoteId, name: &str, body: &[u8]) -> RemoteId {
        self.insert(parent, name, ObjectKind::File, body, MemoryCacheFile::complete(body))
    }

    /// Adds a file whose cache-file starts with `present` bytes and is still
    /// downloading. Returns the cache-file so the test can drive the download.
    pub fn add_downloading_file(
        &self,
        parent: RemoteId,
        name: &str,
        body: &[u8],
        present: usize,
    ) -> (RemoteId, Arc<MemoryCacheFile>) {
        let file = MemoryCacheFile::downloading(&body[..present]);
        let id = self.insert(parent, name, ObjectKind::File, body, Arc::clone(&file));
        (id, file)
    }

    pub fn add_dir(&self, parent: RemoteId, name: &str) -> RemoteId {
        self.insert(
            parent,
            name,
            ObjectKind::Directory,
            &[],
            MemoryCacheFile::complete(&[]),
        )
    }

    fn insert(
        &self,
        parent: RemoteId,
        name: &str,
        kind: ObjectKind,
        body: &[u8],
        file: Arc<MemoryCacheFile>,
    ) -> RemoteId {
        let mut state = self.state.lock().unwrap();
        let id = RemoteId(state.next_id);
        state.next_id += 1;
        state.objects.insert(
            id,
            Object {
                kind,
                parent,
                name: name.as_bytes().to_vec(),
                body: body.to_vec(),
                file,
                times_known: true,
            },
        );
        id
    }

    /// The next `op` request fails with `errno`.
    pub fn fail_next(&self, op: Op, errno: i32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op, u32::try_from(errno).unwrap());
    }

    /// From now on `id` reports no times.
    pub fn forget_times(&self, id: RemoteId) {
        if let Some(obj) = self.state.lock().unwrap().objects.get_mut(&id) {
            obj.times_known = false;
        }
    }

    pub fn exists(&self, id: RemoteId) -> bool {
        self.state.lock().unwrap().objects.contains_key(&id)
    }

    pub fn cache_file(&self, id: RemoteId) -> Arc<MemoryCacheFile> {
        Arc::clone(&self.state.lock().unwrap().objects[&id].file)
    }

    /// Answers one request frame.
    pub fn handle(&self, frame: &RequestFrame, back: &Backchannel) -> (u32, Bytes) {
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.failures.remove(&frame.op) {
            return (errno, Bytes::new());
        }
        match frame.op {
            Op::Lookup => {
                let req: LookupRequest = frame.parse().unwrap();
                let found = state
                    .objects
                    .iter()
                    .find(|(id, obj)| **id != ROOT && obj.parent == req.dir && obj.name == req.name);
                match found {
                    Some((id, obj)) => ok(&LookupReply {
                        obj: *id,
                        attrs: attrs_of(obj),
                    }),
                    None => (libc::ENOENT as u32, Bytes::new()),
                }
            }
            Op::Open => {
                let req: OpenRequest = frame.parse().unwrap();
                let Some(obj) = state.objects.get(&req.obj) else {
                    return (libc::ENOENT as u32, Bytes::new());
                };
                let file: Arc<dyn CacheFile> = obj.file.clone();
                back.deposit(req.binding, DAEMON_PID, file);
                ok(&OpenReply { pid: DAEMON_PID })
            }
            Op::Getattr => {
                let req: ObjectRequest = frame.parse().unwrap();
                match state.objects.get(&req.obj) {
                    Some(obj) => ok(&GetattrReply {
                        attrs: attrs_of(obj),
                        blocks: (obj.body.len() as u64).div_ceil(512),
                        blksize: 512,
                    }),
                    None => (libc::ENOENT as u32, Bytes::new()),
                }
            }
            Op::ReadBytes => {
                let req: ReadBytesRequest = frame.parse().unwrap();
                let obj = &state.objects[&req.obj];
                let start = usize::try_from(req.offset).unwrap();
                let end = start + usize::try_from(req.count).unwrap();
                match obj.body.get(start..end) {
                    Some(bytes) => (0, Bytes::copy_from_slice(bytes)),
                    None => (libc::EINVAL as u32, Bytes::new()),
                }
            }
            Op::Create | Op::Mkdir => {
                let req: CreateRequest = frame.parse().unwrap();
                drop(state);
                let name = String::from_utf8(req.name).unwrap();
                let id = if frame.op == Op::Mkdir {
                    self.add_dir(req.dir, &name)
                } else {
                    self.add_file(req.dir, &name, &[])
                };
                ok(&CreateReply { obj: id })
            }
            Op::Remove | Op::Rmdir => {
                let req: ObjectRequest = frame.parse().unwrap();
                match state.objects.remove(&req.obj) {
                    Some(_) => (0, Bytes::new()),
                    None => (libc::ENOENT as u32, Bytes::new()),
                }
            }
            Op::Rename => {
                let req: RenameRequest = frame.parse().unwrap();
                if let Some(target) = req.to_obj {
                    state.objects.remove(&target);
                }
                let Some(obj) = state.objects.get_mut(&req.from_obj) else {
                    return (libc::ENOENT as u32, Bytes::new());
                };
                obj.parent = req.to_dir;
                obj.name = req.to_name;
                (0, Bytes::new())
            }
            Op::Readdir => {
                let req: ReaddirRequest = frame.parse().unwrap();
                let mut children: Vec<_> = state
                    .objects
                    .iter()
                    .filter(|(id, obj)| **id != ROOT && obj.parent == req.obj)
                    .collect();
                children.sort_by_key(|(id, _)| id.0);
                let mut listing = BytesMut::new();
                for (id, obj) in children {
                    DirRecord {
                        fileno: id.0,
                        kind: obj.kind,
                        name: obj.name.clone(),
                    }
                    .encode(&mut listing)
                    .unwrap();
                }
                state.objects[&req.obj].file.replace(&listing);
                (0, Bytes::new())
            }
            Op::Close | Op::Fsync | Op::InvalidateCaches | Op::Unmount | Op::Read => {
                (0, Bytes::new())
            }
        }
    }
}

fn ok(reply: &impl dav_fs::protocol::Reply) -> (u32, Bytes) {
    (0, reply.to_body())
}

fn attrs_of(obj: &Object) -> RemoteAttrs {
    let time = if obj.times_known {
        server_time()
    } else {
        UNIX_EPOCH
    };
    RemoteAttrs {
        kind: obj.kind,
        size: obj.body.len() as u64,
        atime: time,
        mtime: time,
        ctime: time,
    }
}
