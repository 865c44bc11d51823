//! Sandbox type - one registered microVM and the resources it holds.

use crate::error::{CoreError, Result};
use crate::network::NetworkSlot;
use chrono::{DateTime, Utc};
use cove_vmm::{Hypervisor, VmState, VmmProcess, VmmType};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Maximum sandbox id length; ids become directory and file names.
pub const MAX_SANDBOX_ID_LEN: usize = 128;

/// Check that `id` is usable as a directory name.
pub fn validate_sandbox_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SANDBOX_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidId(id.to_string()))
    }
}

/// The live parts of a sandbox, guarded by its lane.
#[derive(Debug)]
pub(crate) struct SandboxVm {
    pub(crate) hypervisor: Hypervisor,
    pub(crate) process: Box<dyn VmmProcess>,
}

/// A registered sandbox.
///
/// Identity and resource fields are fixed at creation. The hypervisor and
/// its process sit behind the lane, an async mutex that admits one
/// lifecycle operation at a time; a second caller gets
/// [`CoreError::Busy`] instead of queueing.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    template_id: String,
    vmm_type: VmmType,
    slot: NetworkSlot,
    dir: PathBuf,
    /// The sandbox's private writable disk inside `dir`.
    disk: PathBuf,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    /// Mirror of the hypervisor state, readable without the lane.
    state: Mutex<VmState>,
    last_snapshot: Mutex<Option<PathBuf>>,
    lane: tokio::sync::Mutex<SandboxVm>,
}

impl Sandbox {
    pub(crate) fn new(
        id: String,
        template_id: String,
        slot: NetworkSlot,
        dir: PathBuf,
        disk: PathBuf,
        vm: SandboxVm,
    ) -> Self {
        Self {
            vmm_type: vm.hypervisor.vmm_type(),
            pid: vm.process.pid(),
            state: Mutex::new(vm.hypervisor.state()),
            last_snapshot: Mutex::new(None),
            lane: tokio::sync::Mutex::new(vm),
            created_at: Utc::now(),
            id,
            template_id,
            slot,
            dir,
            disk,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn vmm_type(&self) -> VmmType {
        self.vmm_type
    }

    pub fn slot(&self) -> NetworkSlot {
        self.slot
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn disk(&self) -> &Path {
        &self.disk
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> VmState {
        *lock(&self.state)
    }

    pub(crate) fn record_state(&self, vm: &SandboxVm) {
        *lock(&self.state) = vm.hypervisor.state();
    }

    pub(crate) fn record_snapshot(&self, dir: &Path) {
        *lock(&self.last_snapshot) = Some(dir.to_path_buf());
    }

    /// Enter the lane, or fail with `Busy` if another operation holds it.
    pub(crate) fn try_lane(&self) -> Result<tokio::sync::MutexGuard<'_, SandboxVm>> {
        self.lane
            .try_lock()
            .map_err(|_| CoreError::Busy(self.id.clone()))
    }

    pub fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            sandbox_id: self.id.clone(),
            template_id: self.template_id.clone(),
            vmm_type: self.vmm_type,
            state: self.state().to_string(),
            pid: self.pid,
            slot: self.slot.idx(),
            host_ip: self.slot.host_cloned_ip(),
            created_at: self.created_at,
            snapshot_dir: lock(&self.last_snapshot).clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Point-in-time view of a sandbox for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxSummary {
    pub sandbox_id: String,
    pub template_id: String,
    pub vmm_type: VmmType,
    pub state: String,
    pub pid: Option<u32>,
    pub slot: u32,
    /// Address the host reaches the guest at.
    pub host_ip: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
}
