//! Wire messages exchanged with the user-space daemon.
//!
//! Every call is one request frame followed by one reply frame on a fresh
//! channel:
//!
//! ```text
//! request: tag:u32 | header_len:u32 | trailer_len:u32 | header | trailer
//! reply:   status:u32 | body_len:u32 | body
//! ```
//!
//! All integers are little-endian. The header layout is fixed per operation; the
//! trailer carries a variable-length name when the operation needs one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _};

use crate::error::ProtocolError;

/// Set in a reply status when the daemon could not reach the remote server.
pub const CONNECTION_DOWN_MASK: u32 = 0x8000_0000;

/// Number of supplementary group slots carried in every credential block.
pub const NGROUPS: usize = 16;

/// Upper bound for any header, trailer or reply body.
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Size of one record in a directory cache-file.
pub const DIR_RECORD_SIZE: usize = 272;

const DIR_RECORD_NAME_OFFSET: usize = 16;

/// Operation tags understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Op {
    Lookup = 1,
    Open = 2,
    Close = 3,
    /// Whole-body read, served by the daemon from its own cache. Not issued by
    /// the handlers, which read through the bound cache-file.
    Read = 4,
    /// Direct fetch of a byte range, bypassing the cache-file.
    ReadBytes = 5,
    Fsync = 6,
    Getattr = 7,
    Create = 8,
    Mkdir = 9,
    Remove = 10,
    Rmdir = 11,
    Rename = 12,
    Readdir = 13,
    InvalidateCaches = 14,
    Unmount = 15,
}

impl TryFrom<u32> for Op {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => Self::Lookup,
            2 => Self::Open,
            3 => Self::Close,
            4 => Self::Read,
            5 => Self::ReadBytes,
            6 => Self::Fsync,
            7 => Self::Getattr,
            8 => Self::Create,
            9 => Self::Mkdir,
            10 => Self::Remove,
            11 => Self::Rmdir,
            12 => Self::Rename,
            13 => Self::Readdir,
            14 => Self::InvalidateCaches,
            15 => Self::Unmount,
            other => return Err(ProtocolError::UnknownOp(other)),
        })
    }
}

/// Opaque identifier of a remote object, assigned by the daemon.
///
/// Zero never names an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(pub u64);

/// Slot number of a pending cache-file binding, see [`crate::binding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingRef(pub u32);

/// The two kinds of remote objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    File,
    Directory,
}

impl ObjectKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
        }
    }

    fn from_wire(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Caller identity attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    /// Group list; only the first [`NGROUPS`] entries travel on the wire.
    pub groups: Vec<u32>,
}

impl Credentials {
    #[must_use]
    pub fn new(uid: u32, groups: Vec<u32>) -> Self {
        Self { uid, groups }
    }

    /// Credentials of the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::Uid::current().as_raw(),
            groups: vec![nix::unistd::Gid::current().as_raw()],
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let groups = &self.groups[..self.groups.len().min(NGROUPS)];
        buf.put_u32_le(self.uid);
        #[expect(clippy::cast_possible_truncation, reason = "bounded by NGROUPS")]
        buf.put_u32_le(groups.len() as u32);
        for slot in 0..NGROUPS {
            buf.put_u32_le(groups.get(slot).copied().unwrap_or(0));
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let uid = take_u32(buf)?;
        let count = (take_u32(buf)? as usize).min(NGROUPS);
        let mut groups = Vec::with_capacity(count);
        for slot in 0..NGROUPS {
            let gid = take_u32(buf)?;
            if slot < count {
                groups.push(gid);
            }
        }
        Ok(Self { uid, groups })
    }
}

fn need(buf: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn take_id(buf: &mut Bytes) -> Result<RemoteId, ProtocolError> {
    take_u64(buf).map(RemoteId)
}

fn put_time(buf: &mut BytesMut, time: SystemTime) {
    let (secs, nanos) = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (
            i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
            after.subsec_nanos(),
        ),
        Err(before) => {
            let before = before.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            match before.subsec_nanos() {
                0 => (-secs, 0),
                nanos => (-secs - 1, 1_000_000_000 - nanos),
            }
        }
    };
    buf.put_i64_le(secs);
    buf.put_u32_le(nanos);
}

fn take_time(buf: &mut Bytes) -> Result<SystemTime, ProtocolError> {
    need(buf, 12)?;
    let secs = buf.get_i64_le();
    let nanos = Duration::from_nanos(u64::from(buf.get_u32_le().min(999_999_999)));
    let whole = Duration::from_secs(secs.unsigned_abs());
    Ok(if secs >= 0 {
        UNIX_EPOCH + whole + nanos
    } else {
        UNIX_EPOCH - whole + nanos
    })
}

fn expect_name(buf: &mut Bytes, trailer: &Bytes) -> Result<Vec<u8>, ProtocolError> {
    let len = take_u32(buf)? as usize;
    if len != trailer.len() {
        return Err(ProtocolError::UnexpectedLength {
            what: "name trailer",
            expected: len,
            actual: trailer.len(),
        });
    }
    Ok(trailer.to_vec())
}

#[expect(clippy::cast_possible_truncation, reason = "names are bounded by name-max")]
fn put_name_len(buf: &mut BytesMut, name: &[u8]) {
    buf.put_u32_le(name.len() as u32);
}

/// A message the kernel side sends.
pub trait Request {
    fn op(&self) -> Op;

    fn encode_header(&self, buf: &mut BytesMut);

    fn trailer(&self) -> &[u8] {
        &[]
    }

    /// Full request frame, ready to be written to a channel.
    fn to_frame(&self) -> Bytes {
        let mut header = BytesMut::new();
        self.encode_header(&mut header);
        let trailer = self.trailer();

        let mut frame = BytesMut::with_capacity(12 + header.len() + trailer.len());
        frame.put_u32_le(self.op() as u32);
        #[expect(clippy::cast_possible_truncation, reason = "headers are small and fixed")]
        frame.put_u32_le(header.len() as u32);
        #[expect(clippy::cast_possible_truncation, reason = "trailers are bounded names")]
        frame.put_u32_le(trailer.len() as u32);
        frame.put(header);
        frame.put_slice(trailer);
        frame.freeze()
    }
}

/// A request as read off the wire by the daemon side.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub op: Op,
    pub header: Bytes,
    pub trailer: Bytes,
}

impl RequestFrame {
    /// Decode the typed request carried by this frame.
    pub fn parse<T: DecodeRequest>(&self) -> Result<T, ProtocolError> {
        T::decode(self)
    }
}

/// Daemon-side decoding of a request frame.
pub trait DecodeRequest: Sized {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError>;
}

/// A fixed-shape reply body.
pub trait Reply: Sized {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(body: Bytes) -> Result<Self, ProtocolError>;

    fn to_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl Reply for () {
    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        if body.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedLength {
                what: "empty reply",
                expected: 0,
                actual: body.len(),
            })
        }
    }
}

fn expect_drained(buf: &Bytes, what: &'static str, expected: usize) -> Result<(), ProtocolError> {
    if buf.has_remaining() {
        return Err(ProtocolError::UnexpectedLength {
            what,
            expected,
            actual: expected + buf.remaining(),
        });
    }
    Ok(())
}

/// Reads one length-prefixed section, refusing anything over [`MAX_FRAME_LEN`].
async fn read_section<S: AsyncRead + Unpin>(
    stream: &mut S,
    len: u32,
) -> std::io::Result<Bytes> {
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            ProtocolError::Oversized(len),
        ));
    }
    let mut section = vec![0u8; len];
    stream.read_exact(&mut section).await?;
    Ok(Bytes::from(section))
}

/// Read one request frame. Used by daemon implementations.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<RequestFrame> {
    let tag = stream.read_u32_le().await?;
    let header_len = stream.read_u32_le().await?;
    let trailer_len = stream.read_u32_le().await?;
    let op = Op::try_from(tag)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let header = read_section(stream, header_len).await?;
    let trailer = read_section(stream, trailer_len).await?;
    Ok(RequestFrame {
        op,
        header,
        trailer,
    })
}

/// Read one reply frame, returning the raw status word and the body.
pub async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<(u32, Bytes)> {
    let status = stream.read_u32_le().await?;
    let body_len = stream.read_u32_le().await?;
    let body = read_section(stream, body_len).await?;
    Ok((status, body))
}

/// Build a reply frame. Used by daemon implementations.
#[must_use]
pub fn reply_frame(status: u32, body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_u32_le(status);
    #[expect(clippy::cast_possible_truncation, reason = "bodies are bounded by MAX_FRAME_LEN")]
    frame.put_u32_le(body.len() as u32);
    frame.put_slice(body);
    frame.freeze()
}

/// LOOKUP: resolve `name` inside `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub creds: Credentials,
    pub dir: RemoteId,
    pub name: Vec<u8>,
}

impl Request for LookupRequest {
    fn op(&self) -> Op {
        Op::Lookup
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.dir.0);
        put_name_len(buf, &self.name);
    }

    fn trailer(&self) -> &[u8] {
        &self.name
    }
}

impl DecodeRequest for LookupRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        let creds = Credentials::decode(&mut buf)?;
        let dir = take_id(&mut buf)?;
        let name = expect_name(&mut buf, &frame.trailer)?;
        Ok(Self { creds, dir, name })
    }
}

/// Attributes of an object as known by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub kind: ObjectKind,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl RemoteAttrs {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.to_wire());
        buf.put_u64_le(self.size);
        put_time(buf, self.atime);
        put_time(buf, self.mtime);
        put_time(buf, self.ctime);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: ObjectKind::from_wire(take_u8(buf)?)?,
            size: take_u64(buf)?,
            atime: take_time(buf)?,
            mtime: take_time(buf)?,
            ctime: take_time(buf)?,
        })
    }
}

const REMOTE_ATTRS_LEN: usize = 1 + 8 + 3 * 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupReply {
    pub obj: RemoteId,
    pub attrs: RemoteAttrs,
}

impl Reply for LookupReply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.obj.0);
        self.attrs.encode(buf);
    }

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let obj = take_id(&mut body)?;
        let attrs = RemoteAttrs::decode(&mut body)?;
        expect_drained(&body, "lookup reply", 8 + REMOTE_ATTRS_LEN)?;
        Ok(Self { obj, attrs })
    }
}

/// OPEN: ask the daemon to bind a cache-file into `binding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub creds: Credentials,
    pub obj: RemoteId,
    pub flags: u32,
    pub binding: BindingRef,
}

impl Request for OpenRequest {
    fn op(&self) -> Op {
        Op::Open
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.obj.0);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.binding.0);
    }
}

impl DecodeRequest for OpenRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        Ok(Self {
            creds: Credentials::decode(&mut buf)?,
            obj: take_id(&mut buf)?,
            flags: take_u32(&mut buf)?,
            binding: BindingRef(take_u32(&mut buf)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReply {
    /// Process that deposited the cache-file into the binding slot.
    pub pid: u32,
}

impl Reply for OpenReply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.pid);
    }

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let pid = take_u32(&mut body)?;
        expect_drained(&body, "open reply", 4)?;
        Ok(Self { pid })
    }
}

/// A request naming a single object: CLOSE, FSYNC, GETATTR, REMOVE, RMDIR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRequest {
    pub op: Op,
    pub creds: Credentials,
    pub obj: RemoteId,
}

impl Request for ObjectRequest {
    fn op(&self) -> Op {
        self.op
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.obj.0);
    }
}

impl DecodeRequest for ObjectRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        Ok(Self {
            op: frame.op,
            creds: Credentials::decode(&mut buf)?,
            obj: take_id(&mut buf)?,
        })
    }
}

/// READ / READ-BYTES: fetch `count` bytes at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBytesRequest {
    pub creds: Credentials,
    pub obj: RemoteId,
    pub offset: u64,
    pub count: u64,
}

impl Request for ReadBytesRequest {
    fn op(&self) -> Op {
        Op::ReadBytes
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.obj.0);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.count);
    }
}

impl DecodeRequest for ReadBytesRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        Ok(Self {
            creds: Credentials::decode(&mut buf)?,
            obj: take_id(&mut buf)?,
            offset: take_u64(&mut buf)?,
            count: take_u64(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetattrReply {
    pub attrs: RemoteAttrs,
    pub blocks: u64,
    pub blksize: u32,
}

impl Reply for GetattrReply {
    fn encode(&self, buf: &mut BytesMut) {
        self.attrs.encode(buf);
        buf.put_u64_le(self.blocks);
        buf.put_u32_le(self.blksize);
    }

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let attrs = RemoteAttrs::decode(&mut body)?;
        let blocks = take_u64(&mut body)?;
        let blksize = take_u32(&mut body)?;
        expect_drained(&body, "getattr reply", REMOTE_ATTRS_LEN + 12)?;
        Ok(Self {
            attrs,
            blocks,
            blksize,
        })
    }
}

/// CREATE / MKDIR: make `name` inside `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub op: Op,
    pub creds: Credentials,
    pub dir: RemoteId,
    pub mode: u32,
    pub name: Vec<u8>,
}

impl Request for CreateRequest {
    fn op(&self) -> Op {
        self.op
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.dir.0);
        buf.put_u32_le(self.mode);
        put_name_len(buf, &self.name);
    }

    fn trailer(&self) -> &[u8] {
        &self.name
    }
}

impl DecodeRequest for CreateRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        let creds = Credentials::decode(&mut buf)?;
        let dir = take_id(&mut buf)?;
        let mode = take_u32(&mut buf)?;
        let name = expect_name(&mut buf, &frame.trailer)?;
        Ok(Self {
            op: frame.op,
            creds,
            dir,
            mode,
            name,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReply {
    pub obj: RemoteId,
}

impl Reply for CreateReply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.obj.0);
    }

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let obj = take_id(&mut body)?;
        expect_drained(&body, "create reply", 8)?;
        Ok(Self { obj })
    }
}

/// RENAME: move `from_obj` out of `from_dir` to `to_name` inside `to_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest {
    pub creds: Credentials,
    pub from_dir: RemoteId,
    pub from_obj: RemoteId,
    pub to_dir: RemoteId,
    /// The object currently at the target name, if any.
    pub to_obj: Option<RemoteId>,
    pub to_name: Vec<u8>,
}

impl Request for RenameRequest {
    fn op(&self) -> Op {
        Op::Rename
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.from_dir.0);
        buf.put_u64_le(self.from_obj.0);
        buf.put_u64_le(self.to_dir.0);
        buf.put_u64_le(self.to_obj.map_or(0, |id| id.0));
        put_name_len(buf, &self.to_name);
    }

    fn trailer(&self) -> &[u8] {
        &self.to_name
    }
}

impl DecodeRequest for RenameRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        let creds = Credentials::decode(&mut buf)?;
        let from_dir = take_id(&mut buf)?;
        let from_obj = take_id(&mut buf)?;
        let to_dir = take_id(&mut buf)?;
        let to_obj = Some(take_id(&mut buf)?).filter(|id| id.0 != 0);
        let to_name = expect_name(&mut buf, &frame.trailer)?;
        Ok(Self {
            creds,
            from_dir,
            from_obj,
            to_dir,
            to_obj,
            to_name,
        })
    }
}

/// READDIR: have the daemon rewrite the directory's cache-file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirRequest {
    pub creds: Credentials,
    pub obj: RemoteId,
    /// Whether the daemon may answer from its own directory cache.
    pub use_cache: bool,
}

impl Request for ReaddirRequest {
    fn op(&self) -> Op {
        Op::Readdir
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
        buf.put_u64_le(self.obj.0);
        buf.put_u8(u8::from(self.use_cache));
    }
}

impl DecodeRequest for ReaddirRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        Ok(Self {
            creds: Credentials::decode(&mut buf)?,
            obj: take_id(&mut buf)?,
            use_cache: take_u8(&mut buf)? != 0,
        })
    }
}

/// A request that carries only credentials: INVALIDATE-CACHES, UNMOUNT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredsRequest {
    pub op: Op,
    pub creds: Credentials,
}

impl Request for CredsRequest {
    fn op(&self) -> Op {
        self.op
    }

    fn encode_header(&self, buf: &mut BytesMut) {
        self.creds.encode(buf);
    }
}

impl DecodeRequest for CredsRequest {
    fn decode(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        let mut buf = frame.header.clone();
        Ok(Self {
            op: frame.op,
            creds: Credentials::decode(&mut buf)?,
        })
    }
}

/// One entry of a directory cache-file, stored in a [`DIR_RECORD_SIZE`] slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub fileno: u64,
    pub kind: ObjectKind,
    pub name: Vec<u8>,
}

impl DirRecord {
    /// Append this record as one fixed-size slot.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let name_len = u8::try_from(self.name.len()).map_err(|_| {
            ProtocolError::UnexpectedLength {
                what: "directory record name",
                expected: usize::from(u8::MAX),
                actual: self.name.len(),
            }
        })?;
        buf.put_u64_le(self.fileno);
        buf.put_u8(self.kind.to_wire());
        buf.put_u8(name_len);
        buf.put_bytes(0, DIR_RECORD_NAME_OFFSET - 10);
        buf.put_slice(&self.name);
        buf.put_bytes(0, DIR_RECORD_SIZE - DIR_RECORD_NAME_OFFSET - self.name.len());
        Ok(())
    }

    /// Decode one slot. `slot` must be exactly [`DIR_RECORD_SIZE`] bytes.
    pub fn decode(slot: &[u8]) -> Result<Self, ProtocolError> {
        if slot.len() != DIR_RECORD_SIZE {
            return Err(ProtocolError::UnexpectedLength {
                what: "directory record",
                expected: DIR_RECORD_SIZE,
                actual: slot.len(),
            });
        }
        let mut buf = Bytes::copy_from_slice(slot);
        let fileno = take_u64(&mut buf)?;
        let kind = ObjectKind::from_wire(take_u8(&mut buf)?)?;
        let name_len = usize::from(take_u8(&mut buf)?);
        let name = slot[DIR_RECORD_NAME_OFFSET..DIR_RECORD_NAME_OFFSET + name_len].to_vec();
        Ok(Self { fileno, kind, name })
    }
}
