//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::connection::LinkConfig;

/// Runtime settings for a sync peer.
///
/// Every field has a default, so a config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Port used both to reach the peer and to listen for it
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local address to listen on
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Working directory the share directory and record file live in
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Share directory, relative to `root`
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,

    /// Transfer record snapshot, relative to `root`
    #[serde(default = "default_record_file")]
    pub record_file: PathBuf,

    /// Largest single socket read while receiving a file (bytes)
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// How long a listening attempt waits for the peer (seconds)
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,

    /// Pause after a failed listen attempt before dialing again (milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Pause between client rounds that moved no files (milliseconds)
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
}

fn default_port() -> u16 {
    23333
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_share_dir() -> PathBuf {
    PathBuf::from("share")
}

fn default_record_file() -> PathBuf {
    PathBuf::from("sync_record.json")
}

fn default_receive_buffer_size() -> usize {
    100 * 1024 * 1024 // 100 MiB
}

fn default_accept_timeout() -> u64 {
    5
}

fn default_retry_delay() -> u64 {
    500
}

fn default_idle_interval() -> u64 {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            listen_host: default_listen_host(),
            root: default_root(),
            share_dir: default_share_dir(),
            record_file: default_record_file(),
            receive_buffer_size: default_receive_buffer_size(),
            accept_timeout_secs: default_accept_timeout(),
            retry_delay_ms: default_retry_delay(),
            idle_interval_ms: default_idle_interval(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.port != 0, "port must not be 0");
        ensure!(
            self.receive_buffer_size > 0,
            "receive_buffer_size must be greater than 0"
        );
        ensure!(
            self.accept_timeout_secs > 0,
            "accept_timeout_secs must be greater than 0"
        );
        ensure!(
            self.share_dir.is_relative(),
            "share_dir must be relative to root: {:?}",
            self.share_dir
        );
        Ok(())
    }

    /// Share directory resolved against `root`.
    pub fn share_path(&self) -> PathBuf {
        self.root.join(&self.share_dir)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// Connection settings for reaching `peer`.
    pub fn link_config(&self, peer: impl Into<String>) -> LinkConfig {
        LinkConfig {
            peer_host: peer.into(),
            port: self.port,
            listen_host: self.listen_host.clone(),
            accept_timeout: Duration::from_secs(self.accept_timeout_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}
