//! Per-mount tunables.

use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::protocol::RemoteId;

fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(std::env::temp_dir)
        .join("dav-fs")
}

fn default_socket_path() -> PathBuf {
    runtime_dir().join("daemon.sock")
}

fn default_max_connections() -> usize {
    5
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_wait_if_within() -> ByteSize {
    ByteSize::kib(64)
}

fn default_max_io_buffer_size() -> ByteSize {
    ByteSize::mib(1)
}

fn default_true() -> bool {
    true
}

fn default_dir_size() -> u64 {
    2048
}

fn default_root_id() -> u64 {
    1
}

/// Durations are written as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Limits reported through pathconf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathLimits {
    pub name_max: i64,
    pub path_max: i64,
    pub link_max: i64,
    pub pipe_buf: i64,
    pub chown_restricted: bool,
    pub no_trunc: bool,
}

impl Default for PathLimits {
    fn default() -> Self {
        Self {
            name_max: 255,
            path_max: 1024,
            link_max: 1,
            pipe_buf: 512,
            chown_restricted: true,
            no_trunc: true,
        }
    }
}

/// Configuration of one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfig {
    /// Unix socket the daemon listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Ceiling on concurrently open daemon channels.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long to wait for a complete reply.
    #[serde(
        default = "default_receive_timeout",
        rename = "receive-timeout-ms",
        with = "millis"
    )]
    pub receive_timeout: Duration,

    /// Pause before retrying after the daemon reports no route to the server.
    #[serde(
        default = "default_retry_backoff",
        rename = "retry-backoff-ms",
        with = "millis"
    )]
    pub retry_backoff: Duration,

    /// Re-poll interval while waiting on a background download.
    #[serde(
        default = "default_poll_interval",
        rename = "poll-interval-ms",
        with = "millis"
    )]
    pub poll_interval: Duration,

    /// Reads ending further than this past the downloaded size are fetched
    /// directly instead of waiting.
    #[serde(default = "default_wait_if_within")]
    pub wait_if_within: ByteSize,

    /// Largest range the out-of-band fetch will request.
    #[serde(default = "default_max_io_buffer_size")]
    pub max_io_buffer_size: ByteSize,

    /// Never prompt: a lost server connection is treated as dead.
    #[serde(default)]
    pub suppress_all_ui: bool,

    #[serde(default)]
    pub read_only: bool,

    /// Let the daemon answer READDIR from its own cache.
    #[serde(default = "default_true")]
    pub use_daemon_dir_cache: bool,

    /// Size reported for directories.
    #[serde(default = "default_dir_size")]
    pub dir_size: u64,

    /// Remote identifier of the mount root.
    #[serde(default = "default_root_id")]
    pub root_id: u64,

    #[serde(default)]
    pub limits: PathLimits,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: default_max_connections(),
            receive_timeout: default_receive_timeout(),
            retry_backoff: default_retry_backoff(),
            poll_interval: default_poll_interval(),
            wait_if_within: default_wait_if_within(),
            max_io_buffer_size: default_max_io_buffer_size(),
            suppress_all_ui: false,
            read_only: false,
            use_daemon_dir_cache: true,
            dir_size: default_dir_size(),
            root_id: default_root_id(),
            limits: PathLimits::default(),
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn root(&self) -> RemoteId {
        RemoteId(self.root_id)
    }

    /// Check the configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("max-connections must be at least 1.".to_owned());
        }
        if self.receive_timeout.is_zero() {
            errors.push("receive-timeout-ms must be greater than zero.".to_owned());
        }
        if self.poll_interval.is_zero() {
            errors.push("poll-interval-ms must be greater than zero.".to_owned());
        }
        if self.root_id == 0 {
            errors.push("root-id 0 does not name an object.".to_owned());
        }
        if !(1..=255).contains(&self.limits.name_max) {
            errors.push(format!(
                "name-max {} must be between 1 and 255.",
                self.limits.name_max
            ));
        }
        if self.socket_path.parent().is_none() {
            errors.push(format!(
                "Socket path '{}' has no parent directory.",
                self.socket_path.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
