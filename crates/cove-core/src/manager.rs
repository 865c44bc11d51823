//! Sandbox manager - registry and lifecycle orchestration.
//!
//! Create runs: load template → allocate a network slot → wire the
//! network → prepare the sandbox directory → launch the hypervisor →
//! wait for its socket → configure and start (or restore). A failure at
//! any step releases everything acquired before it. Delete and purge run
//! the same steps in reverse.

use crate::config::ManagerConfig;
use crate::error::{CoreError, Result};
use crate::monitor::RegistryStats;
use crate::network::{guest_network_config, IpCommandDriver, NetworkDriver, NetworkSlot, SlotPool};
use crate::orphan::{self, VmmProcessInfo};
use crate::sandbox::{validate_sandbox_id, Sandbox, SandboxSummary, SandboxVm};
use crate::template::{VmTemplate, ROOTFS_NAME, WRITABLE_FS_NAME};
use cove_vmm::{
    CommandLauncher, Hypervisor, HypervisorConfig, LaunchSpec, Launcher, MmdsMetadata,
    SnapshotFiles, VmmType,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Outcome of a bulk operation. Every id is attempted.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, CoreError)>,
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// All failures as one [`CoreError::Aggregate`].
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(CoreError::Aggregate(
                self.failed.into_iter().map(|(_, e)| e).collect(),
            ))
        }
    }
}

/// What a purge acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeKind {
    /// A sandbox in the registry, deleted normally.
    Registered,
    /// A hypervisor process the registry does not know.
    Orphan,
    /// A sandbox directory with no process behind it.
    Leftover,
    /// A network namespace nothing holds.
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeTarget {
    pub target: String,
    pub kind: PurgeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub success: bool,
    pub message: String,
    pub targets: Vec<PurgeTarget>,
}

impl PurgeReport {
    fn new(targets: Vec<PurgeTarget>, mut problems: Vec<String>) -> Self {
        let failed: Vec<&PurgeTarget> = targets.iter().filter(|t| t.error.is_some()).collect();
        problems.extend(failed.iter().map(|t| {
            format!("{}: {}", t.target, t.error.as_deref().unwrap_or_default())
        }));
        let purged = targets.len() - failed.len();
        let message = if problems.is_empty() {
            format!("purged {purged} target(s)")
        } else {
            format!(
                "purged {purged} of {} target(s); {}",
                targets.len(),
                problems.join("; ")
            )
        };
        Self {
            success: problems.is_empty(),
            message,
            targets,
        }
    }
}

/// Manages the set of live sandboxes.
///
/// # Thread Safety
///
/// The registry is an async RwLock: listing runs concurrently, insertion
/// and removal are exclusive. Lifecycle operations on one sandbox are
/// serialized by its lane; creates for different ids never wait on each
/// other.
pub struct SandboxManager {
    config: ManagerConfig,
    sandboxes: RwLock<HashMap<String, Arc<Sandbox>>>,
    /// Ids with a create or teardown in flight. A teardown keeps its id
    /// here until the sandbox directory is gone.
    claims: Mutex<HashMap<String, ClaimKind>>,
    slots: SlotPool,
    launcher: Arc<dyn Launcher>,
    network: Arc<dyn NetworkDriver>,
    stats: RegistryStats,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimKind {
    Create,
    Teardown,
}

/// Releases a claimed id when the operation finishes either way.
struct IdClaim<'a> {
    claims: &'a Mutex<HashMap<String, ClaimKind>>,
    id: String,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        lock(self.claims).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl SandboxManager {
    pub fn new(
        config: ManagerConfig,
        launcher: Arc<dyn Launcher>,
        network: Arc<dyn NetworkDriver>,
    ) -> Self {
        tracing::info!(
            data_root = %config.data_root.display(),
            run_dir = %config.run_dir.display(),
            max_sandboxes = config.max_sandboxes,
            "Creating sandbox manager"
        );
        Self {
            slots: SlotPool::new(config.max_sandboxes),
            sandboxes: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            launcher,
            network,
            stats: RegistryStats::default(),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Manager that launches real hypervisors and configures the host network.
    pub fn with_host_defaults(config: ManagerConfig) -> Self {
        Self::new(config, Arc::new(CommandLauncher), Arc::new(IpCommandDriver::new()))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Boot a new sandbox from `template_id`.
    pub async fn create(&self, template_id: &str, sandbox_id: &str) -> Result<SandboxSummary> {
        self.create_inner(template_id, sandbox_id, None).await
    }

    /// Start a new sandbox from a snapshot instead of booting.
    ///
    /// A disk image saved next to the snapshot replaces the template's
    /// writable disk, so the guest sees the filesystem it was snapshotted
    /// with.
    pub async fn create_from_snapshot(
        &self,
        template_id: &str,
        sandbox_id: &str,
        snapshot_dir: &Path,
    ) -> Result<SandboxSummary> {
        self.create_inner(template_id, sandbox_id, Some(snapshot_dir))
            .await
    }

    async fn create_inner(
        &self,
        template_id: &str,
        sandbox_id: &str,
        restore_from: Option<&Path>,
    ) -> Result<SandboxSummary> {
        validate_sandbox_id(sandbox_id)?;
        let template = VmTemplate::load(&self.config.data_root, template_id).await?;
        let _claim = self.claim(sandbox_id).await?;

        let start = Instant::now();
        let sandbox = match self.provision(&template, sandbox_id, restore_from).await {
            Ok(sandbox) => Arc::new(sandbox),
            Err(e) => {
                RegistryStats::incr(&self.stats.create_failed);
                tracing::error!(sandbox_id, template_id, error = %e, "Sandbox creation failed");
                return Err(e);
            }
        };

        let summary = sandbox.summary();
        self.sandboxes
            .write()
            .await
            .insert(sandbox_id.to_string(), sandbox);
        if restore_from.is_some() {
            RegistryStats::incr(&self.stats.restored);
        }
        RegistryStats::incr(&self.stats.created);
        tracing::info!(
            sandbox_id,
            template_id,
            slot = summary.slot,
            host_ip = %summary.host_ip,
            restored = restore_from.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox registered"
        );
        Ok(summary)
    }

    /// Mark `sandbox_id` as having an operation in flight.
    ///
    /// A second create for the id fails with `AlreadyExists`; anything
    /// racing a teardown fails with `Busy`.
    fn claim_id(&self, sandbox_id: &str, kind: ClaimKind) -> Result<IdClaim<'_>> {
        let mut claims = lock(&self.claims);
        match claims.get(sandbox_id) {
            Some(ClaimKind::Create) if kind == ClaimKind::Create => {
                return Err(CoreError::AlreadyExists(sandbox_id.to_string()))
            }
            Some(_) => return Err(CoreError::Busy(sandbox_id.to_string())),
            None => {}
        }
        claims.insert(sandbox_id.to_string(), kind);
        Ok(IdClaim {
            claims: &self.claims,
            id: sandbox_id.to_string(),
        })
    }

    /// Reserve `sandbox_id` for an in-flight create.
    async fn claim(&self, sandbox_id: &str) -> Result<IdClaim<'_>> {
        let claim = self.claim_id(sandbox_id, ClaimKind::Create)?;
        if self.sandboxes.read().await.contains_key(sandbox_id) {
            return Err(CoreError::AlreadyExists(sandbox_id.to_string()));
        }
        Ok(claim)
    }

    async fn provision(
        &self,
        template: &VmTemplate,
        sandbox_id: &str,
        restore_from: Option<&Path>,
    ) -> Result<Sandbox> {
        let slot = self.slots.allocate()?;
        let dir = self.config.sandbox_dir(sandbox_id);
        match self.bring_up(template, sandbox_id, slot, &dir, restore_from).await {
            Ok((vm, disk)) => Ok(Sandbox::new(
                sandbox_id.to_string(),
                template.template_id.clone(),
                slot,
                dir,
                disk,
                vm,
            )),
            Err(e) => {
                if let Err(cleanup) = self.release_resources(slot, &dir).await {
                    tracing::warn!(sandbox_id, error = %cleanup, "Cleanup after failed create incomplete");
                }
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        template: &VmTemplate,
        sandbox_id: &str,
        slot: NetworkSlot,
        dir: &Path,
        restore_from: Option<&Path>,
    ) -> Result<(SandboxVm, PathBuf)> {
        let vmm_type = template.parsed_vmm_type()?;
        self.network.setup(&slot).await?;
        let disk = self.prepare_dir(template, dir, restore_from).await?;

        let spec = LaunchSpec {
            sandbox_id: sandbox_id.to_string(),
            vmm_type,
            binary_path: self.config.binary_path(vmm_type).clone(),
            socket_path: dir.join(vmm_type.socket_file_name()),
            netns: Some(slot.netns_name()),
            bind_mounts: vec![(
                dir.to_path_buf(),
                template.private_dir(&self.config.data_root),
            )],
        };
        let mut process = self.launcher.launch(&spec).await?;

        let config = self.hypervisor_config(template, vmm_type, sandbox_id, slot, restore_from);
        let mut hypervisor = Hypervisor::new(sandbox_id, &spec.socket_path, config)
            .with_cancellation(self.cancel.child_token());
        if let Err(e) = self.boot(&mut hypervisor, restore_from).await {
            if let Err(kill) = process.kill().await {
                tracing::warn!(sandbox_id, error = %kill, "Failed to kill hypervisor after boot failure");
            }
            return Err(e);
        }
        Ok((SandboxVm { hypervisor, process }, disk))
    }

    async fn boot(&self, hypervisor: &mut Hypervisor, restore_from: Option<&Path>) -> Result<()> {
        hypervisor.wait_ready(self.config.socket_timeout).await?;
        match restore_from {
            Some(snapshot) => hypervisor.restore(snapshot).await?,
            None => {
                hypervisor.configure().await?;
                hypervisor.start().await?;
            }
        }
        Ok(())
    }

    /// Lay out `dir` so it can be bind-mounted over the template's private
    /// dir. Returns the sandbox's writable disk.
    async fn prepare_dir(
        &self,
        template: &VmTemplate,
        dir: &Path,
        restore_from: Option<&Path>,
    ) -> Result<PathBuf> {
        let root = &self.config.data_root;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::create_dir_all(template.private_dir(root)).await?;

        let (disk_name, template_disk) = if template.overlay {
            (WRITABLE_FS_NAME, template.host_writable_path(root))
        } else {
            (ROOTFS_NAME, template.host_rootfs_path(root))
        };
        let source = restore_from
            .map(|snapshot| snapshot.join(disk_name))
            .filter(|saved| saved.is_file())
            .unwrap_or(template_disk);
        let disk = dir.join(disk_name);
        tokio::fs::copy(&source, &disk).await?;

        if template.overlay {
            // The lower layer is shared and read-only.
            tokio::fs::symlink(template.host_rootfs_path(root), dir.join(ROOTFS_NAME)).await?;
        }
        tracing::debug!(dir = %dir.display(), source = %source.display(), "Prepared sandbox directory");
        Ok(disk)
    }

    fn hypervisor_config(
        &self,
        template: &VmTemplate,
        vmm_type: VmmType,
        sandbox_id: &str,
        slot: NetworkSlot,
        restore_from: Option<&Path>,
    ) -> HypervisorConfig {
        let root = &self.config.data_root;
        // Dirty tracking starts at load for restored VMs, so a diff taken
        // from them would miss the base image.
        let diff = restore_from.is_none();
        HypervisorConfig {
            vmm_type,
            vcpu_count: template.vcpu,
            memory_mib: template.mem_mb,
            kernel_path: template.kernel_path(root),
            boot_args: template.kernel_args(self.config.kernel_debug_output),
            rootfs_path: template.private_rootfs_path(root),
            writable_path: template
                .overlay
                .then(|| template.private_writable_path(root)),
            huge_pages: template.huge_pages,
            network: Some(guest_network_config()),
            track_dirty_pages: diff,
            enable_diff_snapshot: diff,
            settle_delay: self.config.settle_delay,
            mmds: Some(MmdsMetadata {
                sandbox_id: sandbox_id.to_string(),
                env_id: template.template_id.clone(),
                address: format!(
                    "http://{}:{}",
                    slot.veth_ip(),
                    self.config.log_collector_port
                ),
                trace_id: None,
                team_id: None,
            }),
        }
    }

    /// Network, slot and directory. Used for failed creates and orphans.
    async fn release_resources(&self, slot: NetworkSlot, dir: &Path) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.network.teardown(&slot).await {
            errors.push(e);
        }
        if self.slots.is_held(slot) {
            self.slots.release(slot);
        }
        if let Err(e) = remove_dir_if_exists(dir).await {
            errors.push(e);
        }
        CoreError::aggregate(errors)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    async fn lookup(&self, sandbox_id: &str) -> Result<Arc<Sandbox>> {
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(sandbox_id.to_string()))
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxSummary> {
        Ok(self.lookup(sandbox_id).await?.summary())
    }

    pub async fn exists(&self, sandbox_id: &str) -> bool {
        self.sandboxes.read().await.contains_key(sandbox_id)
    }

    /// Point-in-time listing, ordered by id.
    pub async fn list(&self) -> Vec<SandboxSummary> {
        let mut out: Vec<SandboxSummary> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|s| s.summary())
            .collect();
        out.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        out
    }

    pub async fn count(&self) -> usize {
        self.sandboxes.read().await.len()
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Stop and remove one sandbox.
    ///
    /// Every teardown step runs even when an earlier one fails; the
    /// sandbox leaves the registry regardless and the failures come back
    /// together. The id cannot be reused until teardown is over.
    pub async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let sandbox = self.lookup(sandbox_id).await?;
        let mut vm = sandbox.try_lane()?;
        let _claim = self.claim_id(sandbox_id, ClaimKind::Teardown)?;
        self.unregister(&sandbox).await?;

        let result = self.destroy(&sandbox, &mut vm).await;
        RegistryStats::incr(&self.stats.deleted);
        match &result {
            Ok(()) => tracing::info!(sandbox_id, "Sandbox deleted"),
            Err(e) => tracing::warn!(sandbox_id, error = %e, "Sandbox deleted with errors"),
        }
        result
    }

    /// Remove `sandbox` from the registry if it is still the registered entry.
    async fn unregister(&self, sandbox: &Arc<Sandbox>) -> Result<()> {
        let mut map = self.sandboxes.write().await;
        match map.get(sandbox.id()) {
            Some(current) if Arc::ptr_eq(current, sandbox) => {
                map.remove(sandbox.id());
                Ok(())
            }
            _ => Err(CoreError::NotFound(sandbox.id().to_string())),
        }
    }

    async fn destroy(&self, sandbox: &Sandbox, vm: &mut SandboxVm) -> Result<()> {
        let mut errors: Vec<CoreError> = Vec::new();
        if let Err(e) = vm.process.kill().await {
            errors.push(e.into());
        }
        if let Err(e) = vm.hypervisor.cleanup().await {
            errors.push(e.into());
        }
        sandbox.record_state(vm);
        if let Err(e) = self.release_resources(sandbox.slot(), sandbox.dir()).await {
            errors.push(e);
        }
        CoreError::aggregate(errors)
    }

    /// Delete each id. One failure never stops the others.
    pub async fn delete_many(&self, sandbox_ids: &[String]) -> BulkOutcome {
        let results =
            futures::future::join_all(sandbox_ids.iter().map(|id| self.delete(id))).await;
        let mut outcome = BulkOutcome::default();
        for (id, result) in sandbox_ids.iter().zip(results) {
            match result {
                Ok(()) => outcome.succeeded.push(id.clone()),
                Err(e) => outcome.failed.push((id.clone(), e)),
            }
        }
        outcome
    }

    pub async fn delete_all(&self) -> BulkOutcome {
        let ids: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
        tracing::info!(count = ids.len(), "Deleting all sandboxes");
        self.delete_many(&ids).await
    }

    // =========================================================================
    // Pause / Resume / Snapshot
    // =========================================================================

    pub async fn pause(&self, sandbox_id: &str) -> Result<SandboxSummary> {
        let sandbox = self.lookup(sandbox_id).await?;
        let mut vm = sandbox.try_lane()?;
        let result = vm.hypervisor.pause().await;
        sandbox.record_state(&vm);
        result?;
        Ok(sandbox.summary())
    }

    pub async fn resume(&self, sandbox_id: &str) -> Result<SandboxSummary> {
        let sandbox = self.lookup(sandbox_id).await?;
        let mut vm = sandbox.try_lane()?;
        let result = vm.hypervisor.resume().await;
        sandbox.record_state(&vm);
        result?;
        Ok(sandbox.summary())
    }

    /// Snapshot into `<snapshot_root>/<sandbox_id>`, replacing any earlier
    /// snapshot there. The sandbox is left paused, or deleted when `delete`
    /// is set.
    pub async fn snapshot(&self, sandbox_id: &str, delete: bool) -> Result<SnapshotFiles> {
        let sandbox = self.lookup(sandbox_id).await?;
        let dir = self.config.snapshot_dir(sandbox_id);
        let files = {
            let mut vm = sandbox.try_lane()?;
            remove_dir_if_exists(&dir).await?;
            let result = vm.hypervisor.snapshot(&dir).await;
            sandbox.record_state(&vm);
            let files = result?;
            // The guest is paused, so the disk is consistent with memory.
            if let Some(name) = sandbox.disk().file_name() {
                tokio::fs::copy(sandbox.disk(), dir.join(name)).await?;
            }
            sandbox.record_snapshot(&dir);
            files
        };
        RegistryStats::incr(&self.stats.snapshots);
        tracing::info!(sandbox_id, dir = %dir.display(), delete, "Sandbox snapshotted");

        if delete {
            self.delete(sandbox_id).await?;
        }
        Ok(files)
    }

    // =========================================================================
    // Orphans
    // =========================================================================

    /// Hypervisor processes under our run dir that no sandbox owns.
    pub async fn list_orphans(&self) -> Result<Vec<VmmProcessInfo>> {
        let found = orphan::scan(&self.config.proc_root, &self.config.run_dir).await?;
        let known: HashSet<String> = {
            let map = self.sandboxes.read().await;
            let claims = lock(&self.claims);
            map.keys().chain(claims.keys()).cloned().collect()
        };
        Ok(found
            .into_iter()
            .filter(|p| !known.contains(&p.sandbox_id))
            .collect())
    }

    /// Registered sandbox holding `slot`, if any.
    async fn slot_owner(&self, slot: NetworkSlot) -> Option<String> {
        self.sandboxes
            .read()
            .await
            .values()
            .find(|s| s.slot() == slot)
            .map(|s| s.id().to_string())
    }

    /// Kill an orphan and free what it held.
    ///
    /// A slot that has since been handed to a registered sandbox is left
    /// alone, namespace included.
    async fn reclaim(&self, orphan: &VmmProcessInfo) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = orphan::kill_process(orphan.pid) {
            errors.push(e);
        }
        let dir = self.config.sandbox_dir(&orphan.sandbox_id);
        let slot = match orphan.slot {
            Some(slot) => match self.slot_owner(slot).await {
                Some(owner) => {
                    tracing::warn!(
                        sandbox_id = %orphan.sandbox_id,
                        slot = slot.idx(),
                        %owner,
                        "Orphan slot now belongs to a live sandbox, keeping its network"
                    );
                    None
                }
                None => Some(slot),
            },
            None => None,
        };
        let cleanup = match slot {
            Some(slot) => self.release_resources(slot, &dir).await,
            None => remove_dir_if_exists(&dir).await,
        };
        if let Err(e) = cleanup {
            errors.push(e);
        }
        tracing::info!(
            sandbox_id = %orphan.sandbox_id,
            pid = orphan.pid,
            failures = errors.len(),
            "Reclaimed orphan sandbox"
        );
        CoreError::aggregate(errors)
    }

    /// Remove sandboxes from OS state, whether or not the registry knows them.
    ///
    /// With `purge_all`, every registered sandbox, every orphan hypervisor
    /// and every network namespace no slot holder owns is removed.
    /// Otherwise each id is looked up in the registry first, then among
    /// orphan processes, then as a leftover directory.
    pub async fn purge(&self, sandbox_ids: &[String], purge_all: bool) -> PurgeReport {
        let mut problems = Vec::new();
        let orphans = match self.list_orphans().await {
            Ok(orphans) => orphans,
            Err(e) => {
                problems.push(format!("orphan scan failed: {e}"));
                Vec::new()
            }
        };

        let mut targets = Vec::new();
        if purge_all {
            let registered: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
            for id in registered {
                targets.push(self.purge_registered(&id).await);
            }
            for orphan in &orphans {
                targets.push(self.purge_orphan(orphan).await);
            }
            match self.network.list_namespaces().await {
                Ok(namespaces) => {
                    for slot in namespaces.into_iter().filter(|s| !self.slots.is_held(*s)) {
                        let error = self.network.teardown(&slot).await.err();
                        targets.push(PurgeTarget {
                            target: slot.netns_name(),
                            kind: PurgeKind::Namespace,
                            pid: None,
                            error: error.map(|e| e.to_string()),
                        });
                    }
                }
                Err(e) => problems.push(format!("namespace listing failed: {e}")),
            }
        } else {
            for id in sandbox_ids {
                let target = if self.exists(id).await {
                    self.purge_registered(id).await
                } else if let Some(orphan) = orphans.iter().find(|o| &o.sandbox_id == id) {
                    self.purge_orphan(orphan).await
                } else {
                    self.purge_leftover(id).await
                };
                targets.push(target);
            }
        }

        let report = PurgeReport::new(targets, problems);
        RegistryStats::incr(&self.stats.purged);
        tracing::info!(success = report.success, message = %report.message, "Purge finished");
        report
    }

    async fn purge_registered(&self, sandbox_id: &str) -> PurgeTarget {
        let pid = self.lookup(sandbox_id).await.ok().and_then(|s| s.pid());
        PurgeTarget {
            target: sandbox_id.to_string(),
            kind: PurgeKind::Registered,
            pid,
            error: self.delete(sandbox_id).await.err().map(|e| e.to_string()),
        }
    }

    async fn purge_orphan(&self, orphan: &VmmProcessInfo) -> PurgeTarget {
        PurgeTarget {
            target: orphan.sandbox_id.clone(),
            kind: PurgeKind::Orphan,
            pid: Some(orphan.pid),
            error: self.reclaim(orphan).await.err().map(|e| e.to_string()),
        }
    }

    async fn purge_leftover(&self, sandbox_id: &str) -> PurgeTarget {
        let error = if validate_sandbox_id(sandbox_id).is_err() {
            Some(CoreError::InvalidId(sandbox_id.to_string()))
        } else {
            let dir = self.config.sandbox_dir(sandbox_id);
            if tokio::fs::metadata(&dir).await.is_ok() {
                remove_dir_if_exists(&dir).await.err()
            } else {
                Some(CoreError::NotFound(sandbox_id.to_string()))
            }
        };
        PurgeTarget {
            target: sandbox_id.to_string(),
            kind: PurgeKind::Leftover,
            pid: None,
            error: error.map(|e| e.to_string()),
        }
    }

    /// Startup pass over OS state left by a previous run.
    ///
    /// Slots held by orphan hypervisors are reserved so new sandboxes do not
    /// collide with them, and namespaces without a process are torn down.
    /// The orphans are returned for a later purge.
    pub async fn reconcile(&self) -> Result<Vec<VmmProcessInfo>> {
        let orphans = self.list_orphans().await?;
        for orphan in &orphans {
            if let Some(slot) = orphan.slot {
                if self.slots.reserve(slot) {
                    tracing::info!(
                        sandbox_id = %orphan.sandbox_id,
                        pid = orphan.pid,
                        slot = slot.idx(),
                        "Reserved slot of orphan sandbox"
                    );
                }
            }
        }

        match self.network.list_namespaces().await {
            Ok(namespaces) => {
                for slot in namespaces.into_iter().filter(|s| !self.slots.is_held(*s)) {
                    if let Err(e) = self.network.teardown(&slot).await {
                        tracing::warn!(netns = %slot.netns_name(), error = %e, "Failed to remove stale namespace");
                    } else {
                        tracing::info!(netns = %slot.netns_name(), "Removed stale namespace");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list network namespaces"),
        }

        tracing::info!(orphans = orphans.len(), "Reconciled host state");
        Ok(orphans)
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Remove sandboxes whose hypervisor exited on its own.
    ///
    /// Sandboxes busy with another operation are skipped until next time.
    pub async fn reap_exited(&self) -> Vec<String> {
        let candidates: Vec<Arc<Sandbox>> =
            self.sandboxes.read().await.values().cloned().collect();
        let mut reaped = Vec::new();
        for sandbox in candidates {
            let Ok(mut vm) = sandbox.try_lane() else {
                continue;
            };
            if !vm.process.has_exited() {
                continue;
            }
            let Ok(_claim) = self.claim_id(sandbox.id(), ClaimKind::Teardown) else {
                continue;
            };
            if self.unregister(&sandbox).await.is_err() {
                continue;
            }
            if let Err(e) = self.destroy(&sandbox, &mut vm).await {
                tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Cleanup of exited sandbox incomplete");
            }
            RegistryStats::incr(&self.stats.reaped);
            reaped.push(sandbox.id().to_string());
        }
        reaped
    }

    /// Abort in-flight waits and delete every sandbox.
    ///
    /// Deletes still running when `grace` runs out are abandoned and their
    /// ids reported as failed with [`CoreError::Timeout`].
    pub async fn shutdown(&self, grace: Duration) -> BulkOutcome {
        self.cancel.cancel();
        let ids: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
        tracing::info!(count = ids.len(), "Deleting all sandboxes");

        let finished = Mutex::new(BulkOutcome::default());
        let record = &finished;
        let deletes = futures::future::join_all(ids.iter().map(|id| async move {
            let result = self.delete(id).await;
            let mut outcome = lock(record);
            match result {
                Ok(()) => outcome.succeeded.push(id.clone()),
                Err(e) => outcome.failed.push((id.clone(), e)),
            }
        }));
        let timed_out = tokio::time::timeout(grace, deletes).await.is_err();

        let mut outcome = finished.into_inner().unwrap_or_else(|e| e.into_inner());
        if timed_out {
            let done: HashSet<String> = outcome
                .succeeded
                .iter()
                .chain(outcome.failed.iter().map(|(id, _)| id))
                .cloned()
                .collect();
            for id in ids.into_iter().filter(|id| !done.contains(id)) {
                outcome.failed.push((id, CoreError::Timeout(grace)));
            }
            tracing::error!(
                grace_ms = grace.as_millis() as u64,
                failed = outcome.failed.len(),
                "Shutdown timed out"
            );
        }
        outcome
    }
}
