//! Transport/Session Manager: one request/reply exchange with the daemon per call.
//!
//! Every call takes a permit from a per-mount semaphore, opens a fresh Unix
//! socket to the daemon, writes one request frame and reads one reply frame.
//! The permit and the socket are owned by the call's stack frame, so every
//! exit path releases both and wakes the next queued caller.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt as _;
use tokio::net::UnixStream;
use tokio::sync::{Semaphore, SemaphorePermit, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::MountConfig;
use crate::error::{ExchangeError, FsError, TransportError};
use crate::protocol::{self, CONNECTION_DOWN_MASK, Op, Reply, Request};

/// Reachability of the daemon and the remote server behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Liveness {
    Up,
    /// The daemon reports the server unreachable; recovery is possible.
    Degraded,
    /// Terminal until remount.
    Dead,
}

/// Per-mount liveness state. Each transition is published exactly once.
#[derive(Debug)]
pub struct LivenessMonitor {
    tx: watch::Sender<Liveness>,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(Liveness::Up),
        }
    }
}

impl LivenessMonitor {
    #[must_use]
    pub fn current(&self) -> Liveness {
        *self.tx.borrow()
    }

    /// Receives one notification per transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Liveness> {
        self.tx.subscribe()
    }

    pub(crate) fn mark_degraded(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == Liveness::Up {
                warn!("server connection is down");
                *state = Liveness::Degraded;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_dead(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == Liveness::Dead {
                false
            } else {
                error!("server connection is dead");
                *state = Liveness::Dead;
                true
            }
        })
    }

    pub(crate) fn mark_up(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == Liveness::Degraded {
                info!("server connection is up");
                *state = Liveness::Up;
                true
            } else {
                false
            }
        })
    }
}

/// Status word and body of one completed exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Server status with the connection-down bit already cleared.
    pub status: u32,
    pub body: Bytes,
}

impl Exchange {
    /// Decodes the body if the server reported success.
    pub fn reply<R: Reply>(self) -> Result<R, FsError> {
        if self.status != 0 {
            return Err(FsError::Server(
                i32::try_from(self.status).unwrap_or(libc::EIO),
            ));
        }
        Ok(R::decode(self.body)?)
    }
}

/// Connection manager for one mount.
#[derive(Debug)]
pub struct Transport {
    socket_path: PathBuf,
    permits: Semaphore,
    max_connections: usize,
    receive_timeout: Duration,
    retry_backoff: Duration,
    suppress_all_ui: bool,
    liveness: LivenessMonitor,
    force_unmount: CancellationToken,
    unmounted: AtomicBool,
}

impl Transport {
    #[must_use]
    pub fn new(config: &MountConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            permits: Semaphore::new(config.max_connections),
            max_connections: config.max_connections,
            receive_timeout: config.receive_timeout,
            retry_backoff: config.retry_backoff,
            suppress_all_ui: config.suppress_all_ui,
            liveness: LivenessMonitor::default(),
            force_unmount: CancellationToken::new(),
            unmounted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    /// Channels currently open to the daemon.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.max_connections - self.permits.available_permits()
    }

    /// Fails every queued and in-flight call with [`TransportError::GoingAway`].
    pub fn force_unmount(&self) {
        debug!("forced unmount: cancelling daemon calls");
        self.force_unmount.cancel();
    }

    #[must_use]
    pub fn is_force_unmounting(&self) -> bool {
        self.force_unmount.is_cancelled()
    }

    /// Token cancelled by a forced unmount; sleeps elsewhere select on it.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.force_unmount
    }

    /// Record that a normal unmount went through, so a vanished daemon
    /// endpoint is no longer an anomaly.
    pub fn mark_unmounted(&self) {
        self.unmounted.store(true, Ordering::Release);
    }

    /// Sleeps for `duration` unless a forced unmount interrupts.
    pub async fn pause(&self, duration: Duration) -> Result<(), TransportError> {
        tokio::select! {
            biased;
            () = self.force_unmount.cancelled() => Err(TransportError::GoingAway),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Send `request` and wait for its reply.
    ///
    /// The connection-down bit is stripped from the returned status. Anything
    /// other than a forced unmount is reported as [`TransportError::Failed`].
    #[instrument(name = "Transport::call", skip(self, request), fields(op = ?request.op()))]
    pub async fn call<R: Request + Sync>(&self, request: &R) -> Result<Exchange, TransportError> {
        let op = request.op();
        let frame = request.to_frame();
        let mut attempt_started = Instant::now();

        loop {
            let (raw, body) = self.exchange(op, &frame).await?;

            if raw & CONNECTION_DOWN_MASK == 0 {
                self.liveness.mark_up();
                return Ok(Exchange { status: raw, body });
            }

            if self.suppress_all_ui {
                self.liveness.mark_dead();
            } else {
                self.liveness.mark_degraded();
            }
            let status = raw & !CONNECTION_DOWN_MASK;

            #[expect(clippy::cast_sign_loss, reason = "errno constants are positive")]
            let no_route = status == libc::ENXIO as u32;
            if !no_route || self.suppress_all_ui {
                return Ok(Exchange { status, body });
            }

            if attempt_started.elapsed() < self.retry_backoff {
                debug!(backoff = ?self.retry_backoff, "server unreachable, backing off");
                self.pause(self.retry_backoff).await?;
            }
            attempt_started = Instant::now();
            trace!("retrying on a fresh channel");
        }
    }

    async fn admit(&self, op: Op) -> Result<SemaphorePermit<'_>, TransportError> {
        if op == Op::Unmount {
            return self
                .permits
                .acquire()
                .await
                .map_err(|_| TransportError::GoingAway);
        }
        if self.is_force_unmounting() {
            return Err(TransportError::GoingAway);
        }
        tokio::select! {
            biased;
            () = self.force_unmount.cancelled() => Err(TransportError::GoingAway),
            permit = self.permits.acquire() => permit.map_err(|_| TransportError::GoingAway),
        }
    }

    /// One attempt on a fresh channel. The permit and socket drop on return.
    async fn exchange(&self, op: Op, frame: &Bytes) -> Result<(u32, Bytes), TransportError> {
        let _permit = self.admit(op).await?;

        let attempt = async {
            let mut stream = self.connect().await?;
            tokio::time::timeout(self.receive_timeout, async {
                stream.write_all(frame).await?;
                stream.flush().await?;
                protocol::read_reply(&mut stream).await
            })
            .await
            .map_err(|_| ExchangeError::Timeout)?
            .map_err(|e| {
                warn!(error = %e, "daemon exchange failed");
                ExchangeError::Io(e)
            })
        };

        if op == Op::Unmount {
            return attempt.await.map_err(TransportError::from);
        }
        tokio::select! {
            biased;
            () = self.force_unmount.cancelled() => Err(TransportError::GoingAway),
            result = attempt => result.map_err(TransportError::from),
        }
    }

    async fn connect(&self) -> Result<UnixStream, ExchangeError> {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                self.liveness.mark_dead();
                Err(ExchangeError::Refused(e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.unmounted.load(Ordering::Acquire) {
                    debug!(path = %self.socket_path.display(), "daemon endpoint gone after unmount");
                } else {
                    warn!(path = %self.socket_path.display(), "daemon endpoint does not exist");
                }
                Err(ExchangeError::NoEndpoint(e))
            }
            Err(e) => {
                warn!(path = %self.socket_path.display(), error = %e, "failed to connect to daemon");
                Err(ExchangeError::Io(e))
            }
        }
    }
}
