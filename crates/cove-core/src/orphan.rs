//! Finding hypervisor processes from OS state alone.
//!
//! Sandboxes are launched as
//! `unshare -pfm --kill-child -- bash -c "... ip netns exec cove-ns-<n> <vmm> --api-sock <run_dir>/<id>/<socket>"`,
//! so the command line of the `unshare` parent carries the namespace, the
//! hypervisor type and the sandbox id. That is enough to reclaim a sandbox
//! after the orchestrator lost track of it.

use crate::error::{CoreError, Result};
use crate::network::NetworkSlot;
use cove_vmm::VmmType;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// A hypervisor process recognised from its command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmmProcessInfo {
    pub pid: u32,
    pub sandbox_id: String,
    pub vmm_type: VmmType,
    pub slot: Option<NetworkSlot>,
    pub socket_path: PathBuf,
}

fn vmm_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?:ip netns exec (?P<netns>\S+) )?(?:'[^']*|\S*)(?:firecracker|cloud-hypervisor)'? (?P<flag>--api-sock|--api-socket) (?:'(?P<quoted>[^']*)'|(?P<socket>\S+))",
        )
        .expect("static regex")
    })
}

/// Recognise a launch command line (arguments joined by spaces).
///
/// Only processes whose socket sits directly in a sandbox directory under
/// `run_dir` are ours.
pub fn parse_cmdline(pid: u32, cmdline: &str, run_dir: &Path) -> Option<VmmProcessInfo> {
    if !cmdline.starts_with("unshare") {
        return None;
    }
    let caps = vmm_pattern().captures(cmdline)?;
    let vmm_type = match &caps["flag"] {
        "--api-sock" => VmmType::Firecracker,
        _ => VmmType::CloudHypervisor,
    };
    let socket_path = PathBuf::from(caps.name("quoted").or(caps.name("socket"))?.as_str());
    let sandbox_dir = socket_path.parent()?;
    if sandbox_dir.parent()? != run_dir {
        return None;
    }
    let sandbox_id = sandbox_dir.file_name()?.to_str()?.to_string();
    let slot = caps
        .name("netns")
        .and_then(|m| NetworkSlot::from_netns_name(m.as_str()));
    Some(VmmProcessInfo {
        pid,
        sandbox_id,
        vmm_type,
        slot,
        socket_path,
    })
}

/// Every hypervisor launched under `run_dir` that is visible in `proc_root`.
pub async fn scan(proc_root: &Path, run_dir: &Path) -> Result<Vec<VmmProcessInfo>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(proc_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can exit between listing and reading.
        let Ok(raw) = tokio::fs::read(entry.path().join("cmdline")).await else {
            continue;
        };
        let cmdline = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(info) = parse_cmdline(pid, &cmdline, run_dir) {
            found.push(info);
        }
    }
    found.sort_by_key(|info| info.pid);
    Ok(found)
}

/// SIGKILL `pid`. A process that is already gone counts as killed.
pub fn kill_process(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| CoreError::Process(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(CoreError::Process(format!("kill {pid}: {e}"))),
    }
}
