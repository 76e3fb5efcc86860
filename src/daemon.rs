//! Commands that talk to a running daemon without mounting anything.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dav_fs::FsError;
use dav_fs::protocol::{Credentials, CredsRequest, GetattrReply, ObjectRequest, Op};
use dav_fs::transport::{Liveness, Transport};
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::app_config;

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .filter(|since| !since.is_zero())
        .map(|since| since.as_secs())
}

async fn probe_root(
    transport: &Transport,
    config: &app_config::Config,
    creds: &Credentials,
) -> Result<GetattrReply, FsError> {
    transport
        .call(&ObjectRequest {
            op: Op::Getattr,
            creds: creds.clone(),
            obj: config.mount.root(),
        })
        .await?
        .reply()
}

/// Asks the daemon to drop everything it has cached.
pub async fn invalidate_caches(config: app_config::Config) -> Result<(), FsError> {
    let transport = Transport::new(&config.mount);
    transport
        .call(&CredsRequest {
            op: Op::InvalidateCaches,
            creds: Credentials::current(),
        })
        .await?
        .reply::<()>()?;
    info!("Daemon caches invalidated.");
    Ok(())
}

/// Prints the root object's attributes and the resulting liveness.
pub async fn probe(config: app_config::Config) -> Result<(), FsError> {
    let transport = Transport::new(&config.mount);
    let result = probe_root(&transport, &config, &Credentials::current()).await;
    let liveness = transport.liveness().current();
    let reply = result?;

    println!("root:     {}", config.mount.root_id);
    println!("kind:     {:?}", reply.attrs.kind);
    println!("size:     {}", reply.attrs.size);
    println!("blocks:   {} x {}", reply.blocks, reply.blksize);
    match unix_secs(reply.attrs.mtime) {
        Some(secs) => println!("mtime:    {secs}"),
        None => println!("mtime:    unknown"),
    }
    println!("liveness: {liveness:?}");
    Ok(())
}

/// Probes the root every `interval` and logs liveness transitions until a
/// termination signal arrives.
pub async fn watch(config: app_config::Config, interval: Duration) -> Result<(), std::io::Error> {
    let transport = Transport::new(&config.mount);
    let creds = Credentials::current();
    let mut liveness = transport.liveness().subscribe();
    let mut ticker = tokio::time::interval(interval);
    let exit = wait_for_exit();
    tokio::pin!(exit);

    info!(socket = %config.mount.socket_path.display(), "Watching the daemon. Press Ctrl+C to stop.");
    loop {
        select! {
            res = &mut exit => return res,
            _ = ticker.tick() => {
                match probe_root(&transport, &config, &creds).await {
                    Ok(reply) => debug!(size = reply.attrs.size, "probe succeeded"),
                    Err(e) => debug!(error = %e, "probe failed"),
                }
            },
            changed = liveness.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                match *liveness.borrow_and_update() {
                    Liveness::Up => info!("Server reachable again."),
                    Liveness::Degraded => warn!("Server unreachable, retrying."),
                    Liveness::Dead => error!("Daemon is gone; the mount is dead."),
                }
            },
        }
    }
}
