//! Configuration types for hypervisor instances.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Pause after configuration before the VM is started.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Drive id of the base root filesystem.
pub const ROOTFS_DRIVE_ID: &str = "rootfs";

/// Drive id of the writable overlay filesystem.
pub const WRITABLE_DRIVE_ID: &str = "writablefs";

/// Supported hypervisor backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmmType {
    #[default]
    Firecracker,
    CloudHypervisor,
}

impl VmmType {
    /// Executable name, also used to recognise hypervisor processes.
    pub fn binary_name(&self) -> &'static str {
        match self {
            VmmType::Firecracker => "firecracker",
            VmmType::CloudHypervisor => "cloud-hypervisor",
        }
    }

    /// Command-line flag that sets the API socket path.
    pub fn api_socket_flag(&self) -> &'static str {
        match self {
            VmmType::Firecracker => "--api-sock",
            VmmType::CloudHypervisor => "--api-socket",
        }
    }

    /// File name of the API socket inside a sandbox's run directory.
    pub fn socket_file_name(&self) -> &'static str {
        match self {
            VmmType::Firecracker => "firecracker.socket",
            VmmType::CloudHypervisor => "ch.socket",
        }
    }
}

impl fmt::Display for VmmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

impl FromStr for VmmType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firecracker" => Ok(VmmType::Firecracker),
            "cloud-hypervisor" => Ok(VmmType::CloudHypervisor),
            other => Err(format!("unknown hypervisor type: {other}")),
        }
    }
}

/// Metadata served to the guest through MMDS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsMetadata {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "envID")]
    pub env_id: String,
    /// Log collector endpoint reachable from the guest.
    pub address: String,
    #[serde(rename = "traceID", default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(rename = "teamID", default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

/// Guest network interface backed by a host tap device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Interface id inside the guest (e.g. `eth0`)
    pub iface_id: String,
    /// Host tap device name
    pub host_dev_name: String,
    /// Guest MAC address
    pub guest_mac: String,
}

/// Everything needed to configure one microVM.
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    pub vmm_type: VmmType,
    pub vcpu_count: u32,
    pub memory_mib: u32,
    pub kernel_path: PathBuf,
    pub boot_args: String,
    /// Base root filesystem. Read-only when a writable overlay is present.
    pub rootfs_path: PathBuf,
    /// Writable overlay drive, attached after the rootfs.
    pub writable_path: Option<PathBuf>,
    pub huge_pages: bool,
    pub network: Option<NetworkConfig>,
    /// Required for diff snapshots.
    pub track_dirty_pages: bool,
    pub enable_diff_snapshot: bool,
    pub settle_delay: Duration,
    pub mmds: Option<MmdsMetadata>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            vmm_type: VmmType::Firecracker,
            vcpu_count: 2,
            memory_mib: 512,
            kernel_path: PathBuf::new(),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            rootfs_path: PathBuf::new(),
            writable_path: None,
            huge_pages: false,
            network: None,
            track_dirty_pages: false,
            enable_diff_snapshot: false,
            settle_delay: DEFAULT_SETTLE_DELAY,
            mmds: None,
        }
    }
}

impl HypervisorConfig {
    /// Whether the base rootfs is mounted read-only under an overlay.
    pub fn overlay(&self) -> bool {
        self.writable_path.is_some()
    }

    /// Memory size in bytes, as Cloud-Hypervisor expects it.
    pub fn memory_bytes(&self) -> u64 {
        u64::from(self.memory_mib) * 1024 * 1024
    }
}
