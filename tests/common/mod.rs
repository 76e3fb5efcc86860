#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod daemon;
pub mod host;
pub mod remote;

use std::sync::Arc;

use dav_fs::DavFs;
use dav_fs::config::MountConfig;
use dav_fs::node::{NodeAttrs, NodeTimes};
use dav_fs::protocol::Credentials;

use daemon::MockDaemon;
use host::MemoryVfs;
use remote::FakeRemote;

pub fn creds() -> Credentials {
    Credentials::new(501, vec![20, 12])
}

/// A mount wired to a [`FakeRemote`] through a [`MockDaemon`].
pub struct Harness {
    pub fs: Arc<DavFs<MemoryVfs>>,
    pub remote: Arc<FakeRemote>,
    pub daemon: MockDaemon,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    /// Like [`Harness::start`], letting the test adjust the configuration.
    pub async fn start_with(configure: impl FnOnce(MountConfig) -> MountConfig) -> Self {
        let remote = FakeRemote::new();
        let daemon = MockDaemon::spawn({
            let remote = Arc::clone(&remote);
            move |frame, back| remote.handle(frame, back)
        });
        let config = configure(daemon.config());
        let fs = Arc::new(
            DavFs::mount(
                MemoryVfs::default(),
                config,
                NodeAttrs {
                    size: 2048,
                    times: NodeTimes::now(),
                },
            )
            .await
            .unwrap(),
        );
        daemon.backchannel().connect(&fs);
        Self { fs, remote, daemon }
    }
}
