//! Firecracker control API bindings.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

use super::transport::UnixTransport;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_engine: Option<IoEngine>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IoEngine {
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MmdsVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MmdsConfig {
    pub version: MmdsVersion,
    pub network_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HugePages {
    None,
    #[serde(rename = "2M")]
    TwoMegabytes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineConfiguration {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    #[serde(default)]
    pub smt: bool,
    #[serde(default)]
    pub track_dirty_pages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huge_pages: Option<HugePages>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
    FlushMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmStateChange {
    Paused,
    Resumed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmPatch {
    pub state: VmStateChange,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotType {
    Full,
    Diff,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotCreateParams {
    pub mem_file_path: String,
    pub snapshot_path: String,
    pub snapshot_type: SnapshotType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemBackendType {
    File,
    Uffd,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryBackend {
    pub backend_path: String,
    pub backend_type: MemBackendType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotLoadParams {
    pub mem_backend: MemoryBackend,
    pub snapshot_path: String,
    #[serde(default)]
    pub enable_diff_snapshots: bool,
    #[serde(default)]
    pub resume_vm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirecrackerVersion {
    pub firecracker_version: String,
}

/// Client for one Firecracker process.
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    transport: UnixTransport,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            transport: UnixTransport::new(socket_path, ""),
        }
    }

    pub fn socket_path(&self) -> &Path {
        self.transport.socket_path()
    }

    pub async fn put_boot_source(&self, boot: &BootSource) -> Result<()> {
        self.transport.put("/boot-source", boot).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        let path = format!("/drives/{}", drive.drive_id);
        self.transport.put(&path, drive).await
    }

    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        let path = format!("/network-interfaces/{}", iface.iface_id);
        self.transport.put(&path, iface).await
    }

    pub async fn put_mmds_config(&self, config: &MmdsConfig) -> Result<()> {
        self.transport.put("/mmds/config", config).await
    }

    pub async fn put_machine_config(&self, config: &MachineConfiguration) -> Result<()> {
        self.transport.put("/machine-config", config).await
    }

    pub async fn create_sync_action(&self, action: ActionType) -> Result<()> {
        self.transport
            .put("/actions", &InstanceActionInfo { action_type: action })
            .await
    }

    pub async fn patch_vm(&self, state: VmStateChange) -> Result<()> {
        self.transport.patch("/vm", &VmPatch { state }).await
    }

    pub async fn create_snapshot(&self, params: &SnapshotCreateParams) -> Result<()> {
        self.transport.put("/snapshot/create", params).await
    }

    pub async fn load_snapshot(&self, params: &SnapshotLoadParams) -> Result<()> {
        self.transport.put("/snapshot/load", params).await
    }

    /// Replace the whole MMDS data store.
    pub async fn put_mmds<T: Serialize>(&self, metadata: &T) -> Result<()> {
        self.transport.put("/mmds", metadata).await
    }

    pub async fn get_version(&self) -> Result<FirecrackerVersion> {
        self.transport.get("/version").await
    }
}
