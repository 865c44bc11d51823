//! Manager configuration.

use crate::network::DEFAULT_MAX_SLOTS;
use cove_vmm::{VmmType, DEFAULT_SETTLE_DELAY, DEFAULT_SOCKET_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;

/// Port the guest ships logs to on its host-side veth address.
pub const DEFAULT_LOG_COLLECTOR_PORT: u16 = 5044;

/// Configuration for [`SandboxManager`](crate::SandboxManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of templates and kernels.
    pub data_root: PathBuf,
    /// Per-sandbox sockets and disks live in `<run_dir>/<sandbox_id>`.
    pub run_dir: PathBuf,
    /// Snapshots are written to `<snapshot_root>/<sandbox_id>` and outlive the sandbox.
    pub snapshot_root: PathBuf,
    pub firecracker_path: PathBuf,
    pub cloud_hypervisor_path: PathBuf,
    /// Upper bound on concurrently attached sandboxes (default: 256 * 60).
    pub max_sandboxes: u32,
    /// How long a freshly spawned hypervisor gets to open its socket.
    pub socket_timeout: Duration,
    /// Pause after configure before booting.
    pub settle_delay: Duration,
    pub log_collector_port: u16,
    /// Verbose guest kernel console.
    pub kernel_debug_output: bool,
    /// Where to scan for orphaned hypervisor processes.
    pub proc_root: PathBuf,
    /// Registry monitor tick.
    pub monitor_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/cove"),
            run_dir: PathBuf::from("/run/cove"),
            snapshot_root: PathBuf::from("/var/lib/cove/snapshots"),
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            cloud_hypervisor_path: PathBuf::from("/usr/local/bin/cloud-hypervisor"),
            max_sandboxes: DEFAULT_MAX_SLOTS,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            log_collector_port: DEFAULT_LOG_COLLECTOR_PORT,
            kernel_debug_output: false,
            proc_root: PathBuf::from("/proc"),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration rooted at `data_root` and `run_dir`.
    ///
    /// Snapshots default to `<data_root>/snapshots`.
    pub fn new(data_root: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            snapshot_root: data_root.join("snapshots"),
            data_root,
            run_dir: run_dir.into(),
            ..Default::default()
        }
    }

    /// Hypervisor binary for `vmm_type`.
    pub fn binary_path(&self, vmm_type: VmmType) -> &PathBuf {
        match vmm_type {
            VmmType::Firecracker => &self.firecracker_path,
            VmmType::CloudHypervisor => &self.cloud_hypervisor_path,
        }
    }

    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_dir.join(sandbox_id)
    }

    pub fn snapshot_dir(&self, sandbox_id: &str) -> PathBuf {
        self.snapshot_root.join(sandbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_sandboxes, 256 * 60);
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.socket_timeout, Duration::from_secs(2));
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn test_paths() {
        let config = ManagerConfig::new("/data", "/run/cove");
        assert_eq!(config.sandbox_dir("sbx"), PathBuf::from("/run/cove/sbx"));
        assert_eq!(
            config.snapshot_dir("sbx"),
            PathBuf::from("/data/snapshots/sbx")
        );
        assert_eq!(
            config.binary_path(VmmType::CloudHypervisor),
            &PathBuf::from("/usr/local/bin/cloud-hypervisor")
        );
    }
}
