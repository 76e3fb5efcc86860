//! A scripted daemon listening on a temporary Unix socket.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use dav_fs::cache_file::CacheFile;
use dav_fs::config::MountConfig;
use dav_fs::protocol::{self, BindingRef, Op, RequestFrame};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt as _;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use super::host::MemoryVfs;
use dav_fs::DavFs;

/// Pid the mock daemon reports and deposits with.
pub const DAEMON_PID: u32 = 4242;

/// Lets a handler reach back into the mount, the way the real daemon
/// deposits cache-files into binding slots before replying to OPEN.
#[derive(Default)]
pub struct Backchannel {
    fs: OnceLock<Weak<DavFs<MemoryVfs>>>,
}

impl Backchannel {
    pub fn connect(&self, fs: &Arc<DavFs<MemoryVfs>>) {
        let _ = self.fs.set(Arc::downgrade(fs));
    }

    pub fn deposit(&self, binding: BindingRef, pid: u32, file: Arc<dyn CacheFile>) {
        let fs = self
            .fs
            .get()
            .and_then(Weak::upgrade)
            .expect("backchannel not connected to a mount");
        fs.bindings().deposit(binding, pid, file).unwrap();
    }
}

type Handler = dyn Fn(&RequestFrame, &Backchannel) -> (u32, Bytes) + Send + Sync;

struct Shared {
    handler: Box<Handler>,
    backchannel: Backchannel,
    requests: Mutex<Vec<RequestFrame>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Accepts one request per connection and answers it with the handler.
pub struct MockDaemon {
    _dir: TempDir,
    socket_path: PathBuf,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockDaemon {
    /// Must be called from inside a Tokio runtime.
    pub fn spawn(
        handler: impl Fn(&RequestFrame, &Backchannel) -> (u32, Bytes) + Send + Sync + 'static,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let shared = Arc::new(Shared {
            handler: Box::new(handler),
            backchannel: Backchannel::default(),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);

                        let Ok(frame) = protocol::read_request(&mut stream).await else {
                            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                            return;
                        };
                        shared.requests.lock().unwrap().push(frame.clone());
                        let (status, body) = (shared.handler)(&frame, &shared.backchannel);
                        let delay = *shared.delay.lock().unwrap();
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        // Before the reply, so the caller cannot reuse its slot first.
                        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                        let _ = stream
                            .write_all(&protocol::reply_frame(status, &body))
                            .await;
                    });
                }
            }
        });

        Self {
            _dir: dir,
            socket_path,
            shared,
            task,
        }
    }

    /// Answers every request with success and an empty body.
    pub fn accept_all() -> Self {
        Self::spawn(|_, _| (0, Bytes::new()))
    }

    /// Holds every reply back for `delay` after the handler ran.
    pub fn set_delay(&self, delay: Duration) {
        *self.shared.delay.lock().unwrap() = delay;
    }

    pub fn backchannel(&self) -> &Backchannel {
        &self.shared.backchannel
    }

    /// A mount configuration pointing at this daemon, with short timers.
    pub fn config(&self) -> MountConfig {
        MountConfig {
            socket_path: self.socket_path.clone(),
            receive_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..MountConfig::default()
        }
    }

    pub fn requests(&self) -> Vec<RequestFrame> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.requests().iter().map(|frame| frame.op).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.ops().into_iter().filter(|seen| *seen == op).count()
    }

    /// Highest number of connections the daemon ever served at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}
