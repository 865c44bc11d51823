//! Configuration for the Cove daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use cove_core::{ManagerConfig, MAX_SLOT_INDEX};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the Cove server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Templates, kernels and snapshots live under here.
    pub data_root: PathBuf,

    /// Per-sandbox sockets and disks.
    pub run_dir: PathBuf,

    /// Where sandbox snapshots are written.
    pub snapshot_root: PathBuf,

    pub firecracker_path: PathBuf,

    pub cloud_hypervisor_path: PathBuf,

    /// Upper bound on live sandboxes (default: 256 * 60).
    pub max_sandboxes: u32,

    /// Verbose guest kernel console (default: false).
    pub kernel_debug_output: bool,

    /// Port of the guest log collector on the host side of each veth.
    pub log_collector_port: u16,

    /// Registry monitor tick (default: 5s).
    pub monitor_interval: Duration,

    /// How long shutdown waits for sandbox deletion (default: 30s).
    pub shutdown_grace: Duration,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("data root not found: {0}")]
    MissingDataRoot(PathBuf),

    #[error("firecracker binary not found: {0}")]
    MissingFirecracker(PathBuf),

    #[error("run directory parent not found: {0}")]
    InvalidRunDir(PathBuf),

    #[error("max sandboxes must be at least 1")]
    NoCapacity,

    #[error("max sandboxes {requested} exceeds the {limit} network slots available")]
    TooManySandboxes { requested: u32, limit: u32 },
}

impl Default for ServerConfig {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            data_root: manager.data_root,
            run_dir: manager.run_dir,
            snapshot_root: manager.snapshot_root,
            firecracker_path: manager.firecracker_path,
            cloud_hypervisor_path: manager.cloud_hypervisor_path,
            max_sandboxes: manager.max_sandboxes,
            kernel_debug_output: manager.kernel_debug_output,
            log_collector_port: manager.log_collector_port,
            monitor_interval: manager.monitor_interval,
            shutdown_grace: Duration::from_secs(30),
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 7300),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `COVE_DATA_ROOT` | `/var/lib/cove` |
    /// | `COVE_RUN_DIR` | `/run/cove` |
    /// | `COVE_SNAPSHOT_ROOT` | `/var/lib/cove/snapshots` |
    /// | `COVE_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `COVE_CLOUD_HYPERVISOR` | `/usr/local/bin/cloud-hypervisor` |
    /// | `COVE_MAX_SANDBOXES` | `15360` |
    /// | `COVE_KERNEL_DEBUG` | `false` |
    /// | `COVE_LOG_COLLECTOR_PORT` | `5044` |
    /// | `COVE_MONITOR_INTERVAL_SECS` | `5` |
    /// | `COVE_SHUTDOWN_GRACE_SECS` | `30` |
    /// | `COVE_HTTP_HOST` | `127.0.0.1` |
    /// | `COVE_HTTP_PORT` | `7300` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let path = |key: &str, fallback: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(fallback);
        let secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let http_host: IpAddr = lookup("COVE_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());
        let http_port: u16 = lookup("COVE_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        let data_root = path("COVE_DATA_ROOT", default.data_root);
        // Snapshots follow a relocated data root unless placed explicitly.
        let snapshot_root = path("COVE_SNAPSHOT_ROOT", data_root.join("snapshots"));

        Self {
            run_dir: path("COVE_RUN_DIR", default.run_dir),
            firecracker_path: path("COVE_FIRECRACKER", default.firecracker_path),
            cloud_hypervisor_path: path("COVE_CLOUD_HYPERVISOR", default.cloud_hypervisor_path),
            max_sandboxes: lookup("COVE_MAX_SANDBOXES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_sandboxes),
            kernel_debug_output: lookup("COVE_KERNEL_DEBUG")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.kernel_debug_output),
            log_collector_port: lookup("COVE_LOG_COLLECTOR_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.log_collector_port),
            monitor_interval: secs("COVE_MONITOR_INTERVAL_SECS", default.monitor_interval),
            shutdown_grace: secs("COVE_SHUTDOWN_GRACE_SECS", default.shutdown_grace),
            http_addr: SocketAddr::new(http_host, http_port),
            data_root,
            snapshot_root,
        }
    }

    /// Manager settings derived from this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(&self.data_root, &self.run_dir);
        config.snapshot_root = self.snapshot_root.clone();
        config.firecracker_path = self.firecracker_path.clone();
        config.cloud_hypervisor_path = self.cloud_hypervisor_path.clone();
        config.max_sandboxes = self.max_sandboxes;
        config.kernel_debug_output = self.kernel_debug_output;
        config.log_collector_port = self.log_collector_port;
        config.monitor_interval = self.monitor_interval;
        config
    }

    /// Validate that the configured paths exist.
    ///
    /// Call this at startup to get clear error messages about missing files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_root.is_dir() {
            return Err(ConfigError::MissingDataRoot(self.data_root.clone()));
        }

        if !self.firecracker_path.exists() {
            return Err(ConfigError::MissingFirecracker(self.firecracker_path.clone()));
        }

        // The run dir is created on demand, so just check its parent.
        if let Some(parent) = self.run_dir.parent() {
            if !parent.exists() {
                return Err(ConfigError::InvalidRunDir(self.run_dir.clone()));
            }
        }

        if self.max_sandboxes == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if self.max_sandboxes > MAX_SLOT_INDEX {
            return Err(ConfigError::TooManySandboxes {
                requested: self.max_sandboxes,
                limit: MAX_SLOT_INDEX,
            });
        }

        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration problem");
        }
        if !self.cloud_hypervisor_path.exists() {
            tracing::warn!(
                path = %self.cloud_hypervisor_path.display(),
                "Cloud-Hypervisor not found, templates using it will fail"
            );
        }
    }
}
