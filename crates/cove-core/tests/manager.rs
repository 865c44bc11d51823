//! Manager lifecycle tests against the in-process mock hypervisor.

use async_trait::async_trait;
use cove_core::{
    CoreError, ManagerConfig, NetworkDriver, NetworkSlot, PurgeKind, RegistryMonitor, Result,
    SandboxManager, TemplateError,
};
use cove_vmm::mock::MockLauncher;
use cove_vmm::VmmType;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const TEMPLATE: &str = "base";

#[derive(Debug, Default)]
struct FakeNetwork {
    events: Mutex<Vec<String>>,
    fail_setup: AtomicBool,
    namespaces: Mutex<Vec<NetworkSlot>>,
}

impl FakeNetwork {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkDriver for FakeNetwork {
    async fn setup(&self, slot: &NetworkSlot) -> Result<()> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(CoreError::Network("setup refused".into()));
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("setup {}", slot.idx()));
        Ok(())
    }

    async fn teardown(&self, slot: &NetworkSlot) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("teardown {}", slot.idx()));
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NetworkSlot>> {
        Ok(self.namespaces.lock().unwrap().clone())
    }
}

struct Harness {
    root: TempDir,
    manager: SandboxManager,
    launcher: MockLauncher,
    network: Arc<FakeNetwork>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut ManagerConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        write_template(root.path(), TEMPLATE, "vcpu = 2\nmem_mb = 512\ndisk_mb = 1024\n");

        let mut config = ManagerConfig::new(root.path().join("data"), root.path().join("run"));
        config.proc_root = root.path().join("proc");
        config.settle_delay = Duration::from_millis(1);
        config.socket_timeout = Duration::from_secs(2);
        std::fs::create_dir_all(&config.proc_root).unwrap();
        tweak(&mut config);

        let launcher = MockLauncher::new();
        let network = Arc::new(FakeNetwork::default());
        let manager = SandboxManager::new(
            config,
            Arc::new(launcher.clone()),
            Arc::clone(&network) as Arc<dyn NetworkDriver>,
        );
        Self {
            root,
            manager,
            launcher,
            network,
        }
    }

    fn run_dir(&self) -> std::path::PathBuf {
        self.root.path().join("run")
    }

    fn slots_in_use(&self) -> usize {
        self.manager.slots().in_use()
    }

    /// Pretend a hypervisor from an earlier run is still alive.
    fn fake_vmm_process(&self, pid: u32, sandbox_id: &str, netns_idx: u32) {
        let dir = self.root.path().join("proc").join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let script = format!(
            "ip netns exec cove-ns-{netns_idx} /usr/local/bin/firecracker --api-sock {}/{sandbox_id}/firecracker.socket",
            self.run_dir().display()
        );
        let args = ["unshare", "-pfm", "--kill-child", "--", "bash", "-c", &script];
        let mut raw = args.join("\0").into_bytes();
        raw.push(0);
        std::fs::write(dir.join("cmdline"), raw).unwrap();
    }
}

fn write_template(root: &Path, id: &str, body: &str) {
    let dir = root.join("data/templates").join(id);
    std::fs::create_dir_all(dir.join("image")).unwrap();
    std::fs::write(
        dir.join("template.toml"),
        format!("template_id = \"{id}\"\n{body}"),
    )
    .unwrap();
    std::fs::write(dir.join("image/rootfs.ext4"), b"rootfs").unwrap();
    std::fs::write(dir.join("image/writable.ext4"), b"writable").unwrap();
}

/// Pid well above any real pid_max, so signalling it fails with ESRCH.
const GHOST_PID: u32 = 0x3fff_fff0;

#[tokio::test]
async fn test_create_then_list() {
    let h = Harness::new();
    let summary = h.manager.create(TEMPLATE, "sbx-1").await.unwrap();
    assert_eq!(summary.sandbox_id, "sbx-1");
    assert_eq!(summary.state, "running");
    assert_eq!(summary.slot, 1);
    assert_eq!(summary.host_ip, "192.168.168.2");

    let listed = h.manager.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].sandbox_id, "sbx-1");

    let dir = h.run_dir().join("sbx-1");
    assert_eq!(std::fs::read(dir.join("rootfs.ext4")).unwrap(), b"rootfs");
    assert_eq!(h.network.events(), vec!["setup 1"]);

    let labels = h.launcher.instance("sbx-1").unwrap().request_labels().await;
    assert!(labels.contains(&"PUT /machine-config".to_string()));
    assert!(labels.contains(&"PUT /actions".to_string()));
    assert_eq!(h.manager.stats().created(), 1);
}

#[tokio::test]
async fn test_overlay_template_copies_writable_disk() {
    let h = Harness::new();
    write_template(
        h.root.path(),
        "layered",
        "vcpu = 1\nmem_mb = 256\ndisk_mb = 512\noverlay = true\n",
    );
    h.manager.create("layered", "sbx-o").await.unwrap();

    let dir = h.run_dir().join("sbx-o");
    assert_eq!(std::fs::read(dir.join("writable.ext4")).unwrap(), b"writable");
    let link = std::fs::read_link(dir.join("rootfs.ext4")).unwrap();
    assert!(link.ends_with("templates/layered/image/rootfs.ext4"));
}

#[tokio::test]
async fn test_delete_unknown_is_not_found() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "keep").await.unwrap();

    let err = h.manager.delete("missing").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(ref id) if id == "missing"));
    assert_eq!(h.manager.count().await, 1);
}

#[tokio::test]
async fn test_delete_releases_everything() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "sbx-1").await.unwrap();
    h.manager.delete("sbx-1").await.unwrap();

    assert_eq!(h.manager.count().await, 0);
    assert_eq!(h.manager.slots().in_use(), 0);
    assert!(!h.run_dir().join("sbx-1").exists());
    assert!(h.launcher.instance("sbx-1").unwrap().has_exited());
    assert_eq!(h.network.events(), vec!["setup 1", "teardown 1"]);

    // The id is free again.
    h.manager.create(TEMPLATE, "sbx-1").await.unwrap();
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "dup").await.unwrap();
    let err = h.manager.create(TEMPLATE, "dup").await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));
    assert_eq!(h.manager.count().await, 1);
    assert_eq!(h.launcher.launched_count(), 1);
}

#[tokio::test]
async fn test_invalid_inputs_rejected_before_provisioning() {
    let h = Harness::new();
    write_template(h.root.path(), "broken", "vcpu = 0\nmem_mb = 512\ndisk_mb = 1\n");

    let err = h.manager.create("broken", "sbx").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Template(TemplateError::InvalidVcpuCount)
    ));
    let err = h.manager.create("nope", "sbx").await.unwrap_err();
    assert!(matches!(err, CoreError::Template(TemplateError::NotFound(_))));
    let err = h.manager.create(TEMPLATE, "../escape").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidId(_)));

    assert_eq!(h.launcher.launched_count(), 0);
    assert_eq!(h.slots_in_use(), 0);
}

#[tokio::test]
async fn test_launch_failure_rolls_back() {
    let h = Harness::new();
    h.launcher.set_fail_launch(true);

    let err = h.manager.create(TEMPLATE, "sbx-1").await.unwrap_err();
    assert!(matches!(err, CoreError::Vm(_)));
    assert_eq!(h.manager.count().await, 0);
    assert_eq!(h.slots_in_use(), 0);
    assert!(!h.run_dir().join("sbx-1").exists());
    assert_eq!(h.network.events(), vec!["setup 1", "teardown 1"]);

    h.launcher.set_fail_launch(false);
    let summary = h.manager.create(TEMPLATE, "sbx-1").await.unwrap();
    assert_eq!(summary.slot, 1);
}

#[tokio::test]
async fn test_network_failure_rolls_back() {
    let h = Harness::new();
    h.network.fail_setup.store(true, Ordering::SeqCst);

    let err = h.manager.create(TEMPLATE, "sbx-1").await.unwrap_err();
    assert!(matches!(err, CoreError::Network(_)));
    assert_eq!(h.slots_in_use(), 0);
    assert_eq!(h.launcher.launched_count(), 0);
}

#[tokio::test]
async fn test_slots_exhausted() {
    let h = Harness::with_config(|c| c.max_sandboxes = 1);
    h.manager.create(TEMPLATE, "a").await.unwrap();
    let err = h.manager.create(TEMPLATE, "b").await.unwrap_err();
    assert!(matches!(err, CoreError::NetworkExhausted(1)));

    h.manager.delete("a").await.unwrap();
    h.manager.create(TEMPLATE, "b").await.unwrap();
}

#[tokio::test]
async fn test_pause_resume() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "sbx").await.unwrap();

    assert_eq!(h.manager.pause("sbx").await.unwrap().state, "paused");
    assert_eq!(h.manager.get("sbx").await.unwrap().state, "paused");
    assert_eq!(h.manager.resume("sbx").await.unwrap().state, "running");
    assert!(matches!(
        h.manager.pause("other").await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_diff_snapshot_and_restore() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "origin").await.unwrap();

    let files = h.manager.snapshot("origin", false).await.unwrap();
    assert_eq!(files.dir, h.manager.config().snapshot_dir("origin"));
    assert!(files.snapfile.is_file());
    assert_eq!(files.memfile_len().unwrap(), 512 << 20);
    assert!(files.memfile_allocated_bytes().unwrap() < 512 << 20);
    assert!(files.dir.join("rootfs.ext4").is_file());

    let origin = h.manager.get("origin").await.unwrap();
    assert_eq!(origin.state, "paused");
    assert_eq!(origin.snapshot_dir.as_deref(), Some(files.dir.as_path()));

    let restored = h
        .manager
        .create_from_snapshot(TEMPLATE, "copy", &files.dir)
        .await
        .unwrap();
    assert_eq!(restored.state, "running");
    assert_ne!(restored.slot, origin.slot);

    let labels = h.launcher.instance("copy").unwrap().request_labels().await;
    assert!(labels.contains(&"PUT /snapshot/load".to_string()));
    assert!(labels.contains(&"PUT /mmds".to_string()));
    assert!(!labels.contains(&"PUT /actions".to_string()));
}

#[tokio::test]
async fn test_cloud_hypervisor_snapshot_and_restore() {
    let h = Harness::new();
    write_template(
        h.root.path(),
        "ch",
        "vcpu = 1\nmem_mb = 256\ndisk_mb = 512\nvmm_type = \"cloud-hypervisor\"\n",
    );
    let origin = h.manager.create("ch", "ch-origin").await.unwrap();
    assert_eq!(origin.vmm_type, VmmType::CloudHypervisor);
    assert_eq!(origin.state, "running");
    let instance = h.launcher.instance("ch-origin").unwrap();
    assert!(instance
        .spec
        .socket_path
        .ends_with(VmmType::CloudHypervisor.socket_file_name()));
    let labels = instance.request_labels().await;
    assert!(labels.contains(&"PUT /api/v1/vm.create".to_string()));
    assert!(labels.contains(&"PUT /api/v1/vm.boot".to_string()));

    let files = h.manager.snapshot("ch-origin", false).await.unwrap();
    assert!(files.exists());
    assert!(files.dir.join("rootfs.ext4").is_file());
    assert_eq!(h.manager.get("ch-origin").await.unwrap().state, "paused");

    let restored = h
        .manager
        .create_from_snapshot("ch", "ch-copy", &files.dir)
        .await
        .unwrap();
    assert_eq!(restored.state, "running");

    // Restored Cloud-Hypervisor guests come up paused and must be resumed.
    let copy = h.launcher.instance("ch-copy").unwrap();
    let labels = copy.request_labels().await;
    assert_eq!(
        &labels[labels.len() - 2..],
        &["PUT /api/v1/vm.restore", "PUT /api/v1/vm.resume"]
    );
    assert!(!labels.contains(&"PUT /api/v1/vm.boot".to_string()));
    assert_eq!(copy.with_hypervisor(|hv| hv.is_paused()).await, Some(false));
}

#[tokio::test]
async fn test_snapshot_with_delete() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "once").await.unwrap();

    let files = h.manager.snapshot("once", true).await.unwrap();
    assert!(files.memfile.is_file());
    assert!(!h.manager.exists("once").await);
    assert!(!h.run_dir().join("once").exists());
}

#[tokio::test]
async fn test_restore_from_missing_snapshot_fails_cleanly() {
    let h = Harness::new();
    let err = h
        .manager
        .create_from_snapshot(TEMPLATE, "ghost", &h.root.path().join("no-snapshot"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Vm(_)));
    assert_eq!(h.manager.count().await, 0);
    assert_eq!(h.slots_in_use(), 0);
    assert!(h.launcher.instance("ghost").unwrap().has_exited());
}

#[tokio::test]
async fn test_bulk_delete_reports_each_id() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "a").await.unwrap();
    h.manager.create(TEMPLATE, "b").await.unwrap();

    let outcome = h
        .manager
        .delete_many(&["a".to_string(), "zzz".to_string()])
        .await;
    assert_eq!(outcome.succeeded, vec!["a".to_string()]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "zzz");
    assert!(matches!(
        outcome.into_result(),
        Err(CoreError::Aggregate(ref errors)) if errors.len() == 1
    ));

    let remaining: Vec<_> = h.manager.list().await.into_iter().map(|s| s.sandbox_id).collect();
    assert_eq!(remaining, vec!["b"]);

    assert!(h.manager.delete_all().await.is_success());
    assert_eq!(h.manager.count().await, 0);
}

#[tokio::test]
async fn test_reap_exited_sandbox() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "live").await.unwrap();
    h.manager.create(TEMPLATE, "dies").await.unwrap();

    h.launcher.crash("dies").await;
    assert_eq!(h.manager.reap_exited().await, vec!["dies".to_string()]);
    assert!(!h.manager.exists("dies").await);
    assert!(h.manager.exists("live").await);
    assert_eq!(h.manager.stats().reaped(), 1);
    assert!(h.manager.reap_exited().await.is_empty());
}

#[tokio::test]
async fn test_monitor_reaps_in_background() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "dies").await.unwrap();
    let launcher = h.launcher.clone();
    let _root = h.root;
    let manager = Arc::new(h.manager);

    let mut monitor = RegistryMonitor::new(Arc::clone(&manager), Duration::from_millis(20));
    monitor.start();
    assert!(monitor.is_running());

    launcher.crash("dies").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.exists("dies").await {
        assert!(tokio::time::Instant::now() < deadline, "sandbox was never reaped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    monitor.shutdown().await;
    assert!(!monitor.is_running());
    assert_eq!(manager.stats().reaped(), 1);
}

#[tokio::test]
async fn test_orphans_exclude_registered() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "known").await.unwrap();
    h.fake_vmm_process(GHOST_PID, "ghost", 9);
    h.fake_vmm_process(GHOST_PID - 1, "known", 1);

    let orphans = h.manager.list_orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].sandbox_id, "ghost");
    assert_eq!(orphans[0].slot, Some(NetworkSlot::new(9)));
}

#[tokio::test]
async fn test_purge_orphan_and_leftover() {
    let h = Harness::new();
    h.fake_vmm_process(GHOST_PID, "ghost", 9);
    std::fs::create_dir_all(h.run_dir().join("ghost")).unwrap();
    std::fs::create_dir_all(h.run_dir().join("stale")).unwrap();

    let report = h
        .manager
        .purge(
            &["ghost".to_string(), "stale".to_string(), "nothing".to_string()],
            false,
        )
        .await;
    assert!(!report.success);
    assert_eq!(report.targets.len(), 3);

    assert_eq!(report.targets[0].kind, PurgeKind::Orphan);
    assert_eq!(report.targets[0].pid, Some(GHOST_PID));
    assert_eq!(report.targets[0].error, None);
    assert_eq!(report.targets[1].kind, PurgeKind::Leftover);
    assert_eq!(report.targets[1].error, None);
    assert!(report.targets[2].error.is_some());

    assert!(!h.run_dir().join("ghost").exists());
    assert!(!h.run_dir().join("stale").exists());
    assert_eq!(h.network.events(), vec!["teardown 9"]);
}

#[tokio::test]
async fn test_purge_orphan_keeps_network_of_live_sandbox() {
    let h = Harness::new();
    let live = h.manager.create(TEMPLATE, "live").await.unwrap();
    assert_eq!(live.slot, 1);
    // A stale process still names the namespace the live sandbox now uses.
    h.fake_vmm_process(GHOST_PID, "ghost", 1);
    std::fs::create_dir_all(h.run_dir().join("ghost")).unwrap();

    let report = h.manager.purge(&["ghost".to_string()], false).await;
    assert!(report.success, "{}", report.message);
    assert_eq!(report.targets[0].kind, PurgeKind::Orphan);
    assert!(!h.run_dir().join("ghost").exists());

    assert_eq!(h.network.events(), vec!["setup 1"]);
    assert!(h.manager.slots().is_held(NetworkSlot::new(1)));
    assert_eq!(h.manager.get("live").await.unwrap().state, "running");
}

#[tokio::test]
async fn test_purge_all() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "a").await.unwrap();
    h.fake_vmm_process(GHOST_PID, "ghost", 9);
    *h.network.namespaces.lock().unwrap() = vec![NetworkSlot::new(1), NetworkSlot::new(4)];

    let report = h.manager.purge(&[], true).await;
    assert!(report.success, "{}", report.message);
    let kinds: Vec<_> = report.targets.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![PurgeKind::Registered, PurgeKind::Orphan, PurgeKind::Namespace, PurgeKind::Namespace]
    );
    assert_eq!(h.manager.count().await, 0);
}

#[tokio::test]
async fn test_reconcile_reserves_orphan_slots() {
    let h = Harness::new();
    h.fake_vmm_process(GHOST_PID, "ghost", 1);
    *h.network.namespaces.lock().unwrap() = vec![NetworkSlot::new(1), NetworkSlot::new(3)];

    let orphans = h.manager.reconcile().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert!(h.manager.slots().is_held(NetworkSlot::new(1)));
    assert_eq!(h.network.events(), vec!["teardown 3"]);

    let summary = h.manager.create(TEMPLATE, "fresh").await.unwrap();
    assert_eq!(summary.slot, 2);
}

#[tokio::test]
async fn test_shutdown_deletes_everything() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "a").await.unwrap();
    h.manager.create(TEMPLATE, "b").await.unwrap();

    let outcome = h.manager.shutdown(Duration::from_secs(5)).await;
    assert_eq!(outcome.succeeded.len(), 2);
    assert_eq!(h.manager.count().await, 0);
}

#[tokio::test]
async fn test_shutdown_reports_deletes_cut_off_by_grace() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "a").await.unwrap();
    h.manager.create(TEMPLATE, "b").await.unwrap();
    h.launcher.set_kill_delay(Duration::from_secs(3600));

    tokio::time::pause();
    let outcome = h.manager.shutdown(Duration::from_secs(1)).await;
    assert!(!outcome.is_success());
    assert!(outcome.succeeded.is_empty());

    let mut failed: Vec<&str> = outcome.failed.iter().map(|(id, _)| id.as_str()).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec!["a", "b"]);
    assert!(outcome
        .failed
        .iter()
        .all(|(_, e)| matches!(e, CoreError::Timeout(grace) if *grace == Duration::from_secs(1))));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_second_operation_on_same_sandbox_is_busy() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "sbx").await.unwrap();

    // The pause holds the sandbox while it waits on the control socket.
    let (paused, resumed) = tokio::join!(h.manager.pause("sbx"), h.manager.resume("sbx"));
    assert_eq!(paused.unwrap().state, "paused");
    assert!(matches!(resumed, Err(CoreError::Busy(ref id)) if id == "sbx"));

    assert_eq!(h.manager.resume("sbx").await.unwrap().state, "running");
}

#[tokio::test]
async fn test_concurrent_creates_of_same_id() {
    let h = Harness::new();
    let (first, second) = tokio::join!(
        h.manager.create(TEMPLATE, "twin"),
        h.manager.create(TEMPLATE, "twin")
    );
    let failures: Vec<CoreError> = [first, second].into_iter().filter_map(|r| r.err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], CoreError::AlreadyExists(_)));
    assert_eq!(h.manager.count().await, 1);
    assert_eq!(h.slots_in_use(), 1);
}

#[tokio::test]
async fn test_parallel_creates_get_distinct_slots() {
    let h = Harness::new();
    let ids: Vec<String> = (0..8).map(|i| format!("par-{i}")).collect();

    let results =
        futures::future::join_all(ids.iter().map(|id| h.manager.create(TEMPLATE, id))).await;
    let mut slots: Vec<u32> = results.into_iter().map(|r| r.unwrap().slot).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 8);
    assert_eq!(h.manager.count().await, 8);
    assert_eq!(h.slots_in_use(), 8);

    let mut netns: Vec<String> = h.network.events();
    netns.sort();
    netns.dedup();
    assert_eq!(netns.len(), 8);
}

#[tokio::test]
async fn test_create_during_slow_delete_is_busy() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "x").await.unwrap();
    h.launcher.set_kill_delay(Duration::from_millis(500));

    let (deleted, recreated) = tokio::join!(
        h.manager.delete("x"),
        h.manager.create(TEMPLATE, "x")
    );
    deleted.unwrap();
    assert!(matches!(recreated, Err(CoreError::Busy(ref id)) if id == "x"));
    assert_eq!(h.slots_in_use(), 0);

    // Once teardown is over the id is usable, and nothing removes the new
    // sandbox's directory.
    h.launcher.set_kill_delay(Duration::ZERO);
    h.manager.create(TEMPLATE, "x").await.unwrap();
    assert!(h.run_dir().join("x").join("rootfs.ext4").is_file());
    assert_eq!(h.manager.get("x").await.unwrap().state, "running");
}

#[tokio::test]
async fn test_orphan_listing_hides_sandbox_being_deleted() {
    let h = Harness::new();
    h.manager.create(TEMPLATE, "going").await.unwrap();
    h.fake_vmm_process(GHOST_PID, "going", 1);
    h.launcher.set_kill_delay(Duration::from_millis(300));

    let (deleted, orphans) = tokio::join!(h.manager.delete("going"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.manager.list_orphans().await
    });
    deleted.unwrap();
    assert!(orphans.unwrap().is_empty());
}
