//! Cloud-Hypervisor control API bindings (`/api/v1`).

use super::transport::UnixTransport;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

const API_BASE: &str = "/api/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// Bytes.
    pub size: u64,
    #[serde(default)]
    pub hugepages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskConfig {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    pub mac: String,
    pub tap: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadConfig {
    pub kernel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsoleMode {
    Off,
    Pty,
    Tty,
    File,
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleConfig {
    pub mode: ConsoleMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmConfig {
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    pub payload: PayloadConfig,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub net: Vec<NetConfig>,
    pub console: ConsoleConfig,
    pub serial: ConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmSnapshotConfig {
    /// `file://<dir>`
    pub destination_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreConfig {
    /// `file://<dir>`
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmmPingResponse {
    pub version: String,
}

/// Client for one Cloud-Hypervisor process.
#[derive(Debug, Clone)]
pub struct CloudHypervisorClient {
    transport: UnixTransport,
}

impl CloudHypervisorClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            transport: UnixTransport::new(socket_path, API_BASE),
        }
    }

    pub fn socket_path(&self) -> &Path {
        self.transport.socket_path()
    }

    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        self.transport.put("/vm.create", config).await
    }

    pub async fn boot_vm(&self) -> Result<()> {
        self.transport.put_empty("/vm.boot").await
    }

    pub async fn pause_vm(&self) -> Result<()> {
        self.transport.put_empty("/vm.pause").await
    }

    pub async fn resume_vm(&self) -> Result<()> {
        self.transport.put_empty("/vm.resume").await
    }

    pub async fn snapshot_vm(&self, config: &VmSnapshotConfig) -> Result<()> {
        self.transport.put("/vm.snapshot", config).await
    }

    pub async fn restore_vm(&self, config: &RestoreConfig) -> Result<()> {
        self.transport.put("/vm.restore", config).await
    }

    pub async fn ping(&self) -> Result<VmmPingResponse> {
        self.transport.get("/vmm.ping").await
    }
}
