//! Hypervisor - lifecycle state machine over either backend.
//!
//! ```text
//!  Unconfigured ──configure──▶ Configured ──start──▶ Running ◀──resume── Paused
//!       │                                             │  ╲──pause──────▶  ▲
//!       │                                             │                   │
//!       └──restore──▶ Restoring ──▶ Running           └──snapshot──▶ Snapshotting
//!
//!  any state ──cleanup──▶ Terminated
//! ```
//!
//! The state machine is written once. Only the wire calls differ between
//! Firecracker and Cloud-Hypervisor, and those live in the match arms on
//! [`Backend`].

use crate::client::cloud_hypervisor::{
    ConsoleConfig, ConsoleMode, CpusConfig, DiskConfig, MemoryConfig, NetConfig, PayloadConfig,
    RestoreConfig, VmConfig, VmSnapshotConfig,
};
use crate::client::firecracker::{
    ActionType, BootSource, Drive, HugePages, IoEngine, MachineConfiguration, MemBackendType,
    MemoryBackend, MmdsConfig, MmdsVersion, NetworkInterface, SnapshotCreateParams,
    SnapshotLoadParams, SnapshotType, VmStateChange,
};
use crate::client::{CloudHypervisorClient, FirecrackerClient};
use crate::config::{HypervisorConfig, VmmType, ROOTFS_DRIVE_ID, WRITABLE_DRIVE_ID};
use crate::error::{ConfigPhase, Result, VmError};
use crate::retry::retry_request;
use crate::snapshot::SnapshotFiles;
use crate::socket::wait_for_socket;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Retry budget for restore calls racing a just-started hypervisor.
pub const RESTORE_MAX_RETRIES: u32 = 3;

/// Lifecycle state of one microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Unconfigured,
    Configured,
    Running,
    Paused,
    Snapshotting,
    Restoring,
    Terminated,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Unconfigured => write!(f, "unconfigured"),
            VmState::Configured => write!(f, "configured"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Snapshotting => write!(f, "snapshotting"),
            VmState::Restoring => write!(f, "restoring"),
            VmState::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone)]
enum Backend {
    Firecracker(FirecrackerClient),
    CloudHypervisor(CloudHypervisorClient),
}

/// Control handle for one hypervisor process.
#[derive(Debug)]
pub struct Hypervisor {
    id: String,
    config: HypervisorConfig,
    backend: Backend,
    state: VmState,
    dirty_tracking: bool,
    cancel: CancellationToken,
}

impl Hypervisor {
    /// Bind to the control socket at `socket_path`. Nothing is sent yet.
    pub fn new(id: impl Into<String>, socket_path: &Path, config: HypervisorConfig) -> Self {
        let backend = match config.vmm_type {
            VmmType::Firecracker => Backend::Firecracker(FirecrackerClient::new(socket_path)),
            VmmType::CloudHypervisor => {
                Backend::CloudHypervisor(CloudHypervisorClient::new(socket_path))
            }
        };
        Self {
            id: id.into(),
            config,
            backend,
            state: VmState::Unconfigured,
            dirty_tracking: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to abort socket waits and restore retries.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    pub fn vmm_type(&self) -> VmmType {
        self.config.vmm_type
    }

    pub fn socket_path(&self) -> &Path {
        match &self.backend {
            Backend::Firecracker(c) => c.socket_path(),
            Backend::CloudHypervisor(c) => c.socket_path(),
        }
    }

    fn expect_state(&self, allowed: &[VmState], expected: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(VmError::InvalidState {
                expected: expected.into(),
                actual: self.state.to_string(),
            })
        }
    }

    /// Wait for the control socket and return the version it reports.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<String> {
        let version = match &self.backend {
            Backend::Firecracker(client) => {
                wait_for_socket(self.socket_path(), timeout, &self.cancel, || async {
                    client.get_version().await.map(|v| v.firecracker_version)
                })
                .await?
            }
            Backend::CloudHypervisor(client) => {
                wait_for_socket(self.socket_path(), timeout, &self.cancel, || async {
                    client.ping().await.map(|v| v.version)
                })
                .await?
            }
        };
        tracing::info!(vm_id = %self.id, vmm = %self.config.vmm_type, %version, "Hypervisor ready");
        Ok(version)
    }

    /// Push the full VM description, then wait the settle delay.
    ///
    /// Steps run in a fixed order: boot source, drives, network, MMDS,
    /// machine config. A failing step is reported with its phase; earlier
    /// steps are not undone and the VM stays unconfigured.
    pub async fn configure(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Unconfigured], "unconfigured")?;
        if self.config.enable_diff_snapshot && !self.config.track_dirty_pages {
            return Err(VmError::SnapshotPrecondition(
                "diff snapshots enabled without dirty page tracking".into(),
            ));
        }

        let start = Instant::now();
        tracing::debug!(
            vm_id = %self.id,
            vmm = %self.config.vmm_type,
            vcpus = self.config.vcpu_count,
            memory_mib = self.config.memory_mib,
            "Configuring VM"
        );

        match &self.backend {
            Backend::Firecracker(client) => configure_firecracker(client, &self.config).await?,
            Backend::CloudHypervisor(client) => {
                client
                    .create_vm(&cloud_hypervisor_vm_config(&self.config))
                    .await
                    .map_err(VmError::at(ConfigPhase::CreateVm))?;
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;
        self.dirty_tracking = self.config.track_dirty_pages;
        self.state = VmState::Configured;

        tracing::info!(
            vm_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM configured"
        );
        Ok(())
    }

    /// Boot the configured VM.
    pub async fn start(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Configured], "configured")?;
        let start = Instant::now();

        match &self.backend {
            Backend::Firecracker(client) => {
                client.create_sync_action(ActionType::InstanceStart).await?
            }
            Backend::CloudHypervisor(client) => client.boot_vm().await?,
        }

        self.state = VmState::Running;
        tracing::info!(
            vm_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM started"
        );
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Running], "running")?;
        match &self.backend {
            Backend::Firecracker(client) => client.patch_vm(VmStateChange::Paused).await?,
            Backend::CloudHypervisor(client) => client.pause_vm().await?,
        }
        self.state = VmState::Paused;
        tracing::debug!(vm_id = %self.id, "VM paused");
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Paused], "paused")?;
        match &self.backend {
            Backend::Firecracker(client) => client.patch_vm(VmStateChange::Resumed).await?,
            Backend::CloudHypervisor(client) => client.resume_vm().await?,
        }
        self.state = VmState::Running;
        tracing::debug!(vm_id = %self.id, "VM resumed");
        Ok(())
    }

    /// Write a snapshot into `dir`. A running VM is paused first and the VM
    /// is left paused either way.
    pub async fn snapshot(&mut self, dir: &Path) -> Result<SnapshotFiles> {
        self.expect_state(&[VmState::Running, VmState::Paused], "running or paused")?;
        let diff = self.config.enable_diff_snapshot && self.config.vmm_type == VmmType::Firecracker;
        if diff && !self.dirty_tracking {
            return Err(VmError::SnapshotPrecondition(
                "diff snapshot requested but dirty page tracking is off".into(),
            ));
        }

        if self.state == VmState::Running {
            self.pause().await?;
        }

        let start = Instant::now();
        tokio::fs::create_dir_all(dir).await?;
        let files = SnapshotFiles::for_vmm(self.config.vmm_type, dir);
        self.state = VmState::Snapshotting;

        let result = match &self.backend {
            Backend::Firecracker(client) => {
                client
                    .create_snapshot(&SnapshotCreateParams {
                        mem_file_path: files.memfile.to_string_lossy().into_owned(),
                        snapshot_path: files.snapfile.to_string_lossy().into_owned(),
                        snapshot_type: if diff {
                            SnapshotType::Diff
                        } else {
                            SnapshotType::Full
                        },
                    })
                    .await
            }
            Backend::CloudHypervisor(client) => {
                client
                    .snapshot_vm(&VmSnapshotConfig {
                        destination_url: file_url(dir),
                    })
                    .await
            }
        };

        self.state = VmState::Paused;
        result?;

        tracing::info!(
            vm_id = %self.id,
            dir = %dir.display(),
            diff,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM snapshot created"
        );
        Ok(files)
    }

    /// Bring up a fresh hypervisor from the snapshot in `dir`.
    ///
    /// The load call and the MMDS push are each retried on transient socket
    /// errors. A failed restore leaves the VM terminated since neither
    /// backend accepts a second load.
    pub async fn restore(&mut self, dir: &Path) -> Result<()> {
        self.expect_state(&[VmState::Unconfigured], "unconfigured")?;
        let start = Instant::now();
        self.state = VmState::Restoring;

        match self.restore_inner(dir).await {
            Ok(retries) => {
                self.state = VmState::Running;
                self.dirty_tracking = self.config.enable_diff_snapshot;
                tracing::info!(
                    vm_id = %self.id,
                    dir = %dir.display(),
                    retry_times = retries,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "VM restored"
                );
                Ok(())
            }
            Err(e) => {
                self.state = VmState::Terminated;
                tracing::error!(vm_id = %self.id, error = %e, "VM restore failed");
                Err(e)
            }
        }
    }

    async fn restore_inner(&self, dir: &Path) -> Result<u32> {
        let files = SnapshotFiles::for_vmm(self.config.vmm_type, dir);
        match &self.backend {
            Backend::Firecracker(client) => {
                let params = SnapshotLoadParams {
                    mem_backend: MemoryBackend {
                        backend_path: files.memfile.to_string_lossy().into_owned(),
                        backend_type: MemBackendType::File,
                    },
                    snapshot_path: files.snapfile.to_string_lossy().into_owned(),
                    enable_diff_snapshots: self.config.enable_diff_snapshot,
                    resume_vm: true,
                };
                let (load_retries, result) =
                    retry_request(&self.cancel, RESTORE_MAX_RETRIES, || client.load_snapshot(&params))
                        .await;
                result?;

                let mut mmds_retries = 0;
                if let Some(metadata) = &self.config.mmds {
                    let (retries, result) =
                        retry_request(&self.cancel, RESTORE_MAX_RETRIES, || client.put_mmds(metadata))
                            .await;
                    result?;
                    mmds_retries = retries;
                }
                Ok(load_retries + mmds_retries)
            }
            Backend::CloudHypervisor(client) => {
                let restore = RestoreConfig {
                    source_url: file_url(dir),
                };
                let (restore_retries, result) =
                    retry_request(&self.cancel, RESTORE_MAX_RETRIES, || client.restore_vm(&restore))
                        .await;
                result?;
                // Restored Cloud-Hypervisor VMs come up paused.
                let (resume_retries, result) =
                    retry_request(&self.cancel, RESTORE_MAX_RETRIES, || client.resume_vm()).await;
                result?;
                Ok(restore_retries + resume_retries)
            }
        }
    }

    /// Mark the VM terminated. Neither backend needs teardown calls beyond
    /// killing the process, which the process owner does.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.state = VmState::Terminated;
        tracing::debug!(vm_id = %self.id, "VM terminated");
        Ok(())
    }
}

async fn configure_firecracker(client: &FirecrackerClient, config: &HypervisorConfig) -> Result<()> {
    client
        .put_boot_source(&BootSource {
            kernel_image_path: config.kernel_path.to_string_lossy().into_owned(),
            boot_args: Some(config.boot_args.clone()),
        })
        .await
        .map_err(VmError::at(ConfigPhase::BootSource))?;

    for drive in firecracker_drives(config) {
        client
            .put_drive(&drive)
            .await
            .map_err(VmError::at(ConfigPhase::Drives))?;
    }

    if let Some(net) = &config.network {
        client
            .put_network_interface(&NetworkInterface {
                iface_id: net.iface_id.clone(),
                guest_mac: net.guest_mac.clone(),
                host_dev_name: net.host_dev_name.clone(),
            })
            .await
            .map_err(VmError::at(ConfigPhase::Network))?;
    }

    if let (Some(net), Some(metadata)) = (&config.network, &config.mmds) {
        client
            .put_mmds_config(&MmdsConfig {
                version: MmdsVersion::V2,
                network_interfaces: vec![net.iface_id.clone()],
            })
            .await
            .map_err(VmError::at(ConfigPhase::Mmds))?;
        client
            .put_mmds(metadata)
            .await
            .map_err(VmError::at(ConfigPhase::Mmds))?;
    }

    client
        .put_machine_config(&MachineConfiguration {
            vcpu_count: config.vcpu_count,
            mem_size_mib: config.memory_mib,
            smt: true,
            track_dirty_pages: config.track_dirty_pages,
            huge_pages: config.huge_pages.then_some(HugePages::TwoMegabytes),
        })
        .await
        .map_err(VmError::at(ConfigPhase::Machine))
}

fn firecracker_drives(config: &HypervisorConfig) -> Vec<Drive> {
    let mut drives = vec![Drive {
        drive_id: ROOTFS_DRIVE_ID.into(),
        path_on_host: config.rootfs_path.to_string_lossy().into_owned(),
        is_root_device: true,
        is_read_only: config.overlay(),
        io_engine: Some(IoEngine::Async),
    }];
    if let Some(writable) = &config.writable_path {
        drives.push(Drive {
            drive_id: WRITABLE_DRIVE_ID.into(),
            path_on_host: writable.to_string_lossy().into_owned(),
            is_root_device: false,
            is_read_only: false,
            io_engine: Some(IoEngine::Async),
        });
    }
    drives
}

fn cloud_hypervisor_vm_config(config: &HypervisorConfig) -> VmConfig {
    let mut disks = vec![DiskConfig {
        id: ROOTFS_DRIVE_ID.into(),
        path: config.rootfs_path.to_string_lossy().into_owned(),
        readonly: config.overlay(),
    }];
    if let Some(writable) = &config.writable_path {
        disks.push(DiskConfig {
            id: WRITABLE_DRIVE_ID.into(),
            path: writable.to_string_lossy().into_owned(),
            readonly: false,
        });
    }

    VmConfig {
        cpus: CpusConfig {
            boot_vcpus: config.vcpu_count,
            max_vcpus: config.vcpu_count,
        },
        memory: MemoryConfig {
            size: config.memory_bytes(),
            hugepages: config.huge_pages,
        },
        payload: PayloadConfig {
            kernel: config.kernel_path.to_string_lossy().into_owned(),
            cmdline: Some(config.boot_args.clone()),
        },
        disks,
        net: config
            .network
            .iter()
            .map(|net| NetConfig {
                mac: net.guest_mac.clone(),
                tap: net.host_dev_name.clone(),
            })
            .collect(),
        console: ConsoleConfig {
            mode: ConsoleMode::Tty,
        },
        serial: ConsoleConfig {
            mode: ConsoleMode::Null,
        },
    }
}

fn file_url(dir: &Path) -> String {
    format!("file://{}", dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MmdsMetadata, NetworkConfig};
    use crate::mock::MockHypervisor;
    use std::path::PathBuf;

    fn test_config(vmm_type: VmmType) -> HypervisorConfig {
        HypervisorConfig {
            vmm_type,
            vcpu_count: 2,
            memory_mib: 512,
            kernel_path: PathBuf::from("/kernels/5.10.186/vmlinux"),
            rootfs_path: PathBuf::from("/templates/base/rootfs.ext4"),
            writable_path: Some(PathBuf::from("/run/sbx/writable.ext4")),
            network: Some(NetworkConfig {
                iface_id: "eth0".into(),
                host_dev_name: "tap0".into(),
                guest_mac: "02:FC:00:00:00:05".into(),
            }),
            track_dirty_pages: true,
            enable_diff_snapshot: true,
            settle_delay: Duration::ZERO,
            mmds: Some(MmdsMetadata {
                sandbox_id: "sbx-1".into(),
                env_id: "base".into(),
                address: "http://10.168.0.1:5044".into(),
                trace_id: None,
                team_id: None,
            }),
            ..Default::default()
        }
    }

    async fn ready(vmm_type: VmmType, dir: &Path) -> (MockHypervisor, Hypervisor) {
        let socket = dir.join("api.sock");
        let mock = MockHypervisor::start(vmm_type, &socket).await.unwrap();
        let vm = Hypervisor::new("sbx-1", &socket, test_config(vmm_type));
        vm.wait_ready(Duration::from_secs(2)).await.unwrap();
        (mock, vm)
    }

    #[tokio::test]
    async fn test_firecracker_configure_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;

        vm.configure().await.unwrap();
        assert_eq!(vm.state(), VmState::Configured);
        assert_eq!(
            mock.request_labels(),
            vec![
                "GET /version",
                "PUT /boot-source",
                "PUT /drives/rootfs",
                "PUT /drives/writablefs",
                "PUT /network-interfaces/eth0",
                "PUT /mmds/config",
                "PUT /mmds",
                "PUT /machine-config",
            ]
        );

        let requests = mock.requests();
        assert_eq!(requests[2].body["is_read_only"], true);
        assert_eq!(requests[5].body["version"], "V2");
        assert_eq!(requests[6].body["sandboxID"], "sbx-1");
        assert_eq!(requests[7].body["smt"], true);
    }

    #[tokio::test]
    async fn test_start_requires_configure() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;

        let err = vm.start().await.unwrap_err();
        assert!(matches!(err, VmError::InvalidState { .. }));
        assert_eq!(vm.state(), VmState::Unconfigured);

        let err = vm.snapshot(&dir.path().join("snap")).await.unwrap_err();
        assert!(matches!(err, VmError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_configure_failure_names_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;
        mock.fail_path("/drives/writablefs", 400, "drive file missing");

        let err = vm.configure().await.unwrap_err();
        match err {
            VmError::Configure { phase, .. } => assert_eq!(phase, ConfigPhase::Drives),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(vm.state(), VmState::Unconfigured);
        assert!(!mock.request_labels().contains(&"PUT /machine-config".to_string()));
    }

    #[tokio::test]
    async fn test_diff_snapshot_requires_dirty_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let mock = MockHypervisor::start(VmmType::Firecracker, &socket).await.unwrap();
        let config = HypervisorConfig {
            track_dirty_pages: false,
            ..test_config(VmmType::Firecracker)
        };
        let mut vm = Hypervisor::new("sbx-1", &socket, config);

        let err = vm.configure().await.unwrap_err();
        assert!(matches!(err, VmError::SnapshotPrecondition(_)));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;
        vm.configure().await.unwrap();
        vm.start().await.unwrap();

        vm.pause().await.unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        assert!(mock.is_paused());
        assert!(matches!(vm.pause().await, Err(VmError::InvalidState { .. })));

        vm.resume().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert!(!mock.is_paused());
    }

    #[tokio::test]
    async fn test_failed_pause_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;
        vm.configure().await.unwrap();
        vm.start().await.unwrap();

        mock.fail_path("/vm", 500, "busy");
        assert!(vm.pause().await.is_err());
        assert_eq!(vm.state(), VmState::Running);
    }

    #[tokio::test]
    async fn test_diff_snapshot_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;
        vm.configure().await.unwrap();
        vm.start().await.unwrap();

        let snap_dir = dir.path().join("snapshot");
        let files = vm.snapshot(&snap_dir).await.unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        assert!(files.exists());
        let memory_bytes = 512 * 1024 * 1024;
        assert_eq!(files.memfile_len().unwrap(), memory_bytes);
        assert!(files.memfile_allocated_bytes().unwrap() < memory_bytes);

        let create = mock
            .requests()
            .into_iter()
            .find(|r| r.path == "/snapshot/create")
            .unwrap();
        assert_eq!(create.body["snapshot_type"], "Diff");

        let restore_socket = dir.path().join("restore.sock");
        let restore_mock = MockHypervisor::start(VmmType::Firecracker, &restore_socket)
            .await
            .unwrap();
        let mut restored = Hypervisor::new("sbx-2", &restore_socket, test_config(VmmType::Firecracker));
        restored.wait_ready(Duration::from_secs(2)).await.unwrap();
        restored.restore(&snap_dir).await.unwrap();

        assert_eq!(restored.state(), VmState::Running);
        assert!(restore_mock.is_running());
        assert!(!restore_mock.is_paused());
        assert_eq!(
            restore_mock.request_labels(),
            vec!["GET /version", "PUT /snapshot/load", "PUT /mmds"]
        );
    }

    #[tokio::test]
    async fn test_restore_retries_dropped_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;
        vm.configure().await.unwrap();
        vm.start().await.unwrap();
        let snap_dir = dir.path().join("snapshot");
        vm.snapshot(&snap_dir).await.unwrap();
        drop(mock);

        let socket = dir.path().join("restore.sock");
        let restore_mock = MockHypervisor::start(VmmType::Firecracker, &socket).await.unwrap();
        let mut restored = Hypervisor::new("sbx-2", &socket, test_config(VmmType::Firecracker));
        restore_mock.drop_next_connections(2);

        restored.restore(&snap_dir).await.unwrap();
        assert_eq!(restored.state(), VmState::Running);
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;

        let err = vm.restore(&dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, VmError::Api { status: 400, .. }));
        assert_eq!(vm.state(), VmState::Terminated);
    }

    #[tokio::test]
    async fn test_cloud_hypervisor_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, mut vm) = ready(VmmType::CloudHypervisor, dir.path()).await;
        vm.configure().await.unwrap();
        vm.start().await.unwrap();
        assert!(mock.is_running());

        let snap_dir = dir.path().join("snapshot");
        let files = vm.snapshot(&snap_dir).await.unwrap();
        assert!(files.exists());
        assert_eq!(vm.state(), VmState::Paused);

        let create = &mock.requests()[1];
        assert_eq!(create.path, "/api/v1/vm.create");
        assert_eq!(create.body["memory"]["size"], 512u64 * 1024 * 1024);
        assert_eq!(create.body["disks"][0]["readonly"], true);

        let socket = dir.path().join("restore.sock");
        let restore_mock = MockHypervisor::start(VmmType::CloudHypervisor, &socket)
            .await
            .unwrap();
        let mut restored = Hypervisor::new("sbx-2", &socket, test_config(VmmType::CloudHypervisor));
        restored.restore(&snap_dir).await.unwrap();
        assert_eq!(restored.state(), VmState::Running);
        assert!(!restore_mock.is_paused());
        assert_eq!(
            restore_mock.request_labels(),
            vec!["PUT /api/v1/vm.restore", "PUT /api/v1/vm.resume"]
        );
    }

    #[tokio::test]
    async fn test_cloud_hypervisor_restore_retries_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, mut vm) = ready(VmmType::CloudHypervisor, dir.path()).await;
        vm.configure().await.unwrap();
        vm.start().await.unwrap();
        let snap_dir = dir.path().join("snapshot");
        vm.snapshot(&snap_dir).await.unwrap();

        let socket = dir.path().join("restore.sock");
        let restore_mock = MockHypervisor::start(VmmType::CloudHypervisor, &socket)
            .await
            .unwrap();
        restore_mock.drop_next_requests("/api/v1/vm.resume", 2);
        let mut restored = Hypervisor::new("sbx-2", &socket, test_config(VmmType::CloudHypervisor));
        restored.restore(&snap_dir).await.unwrap();

        assert_eq!(restored.state(), VmState::Running);
        assert!(!restore_mock.is_paused());
        assert_eq!(
            restore_mock.request_labels(),
            vec![
                "PUT /api/v1/vm.restore",
                "PUT /api/v1/vm.resume",
                "PUT /api/v1/vm.resume",
                "PUT /api/v1/vm.resume",
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, mut vm) = ready(VmmType::Firecracker, dir.path()).await;
        vm.cleanup().await.unwrap();
        assert_eq!(vm.state(), VmState::Terminated);
        assert!(matches!(vm.configure().await, Err(VmError::InvalidState { .. })));
    }
}
