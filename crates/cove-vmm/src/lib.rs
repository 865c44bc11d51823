//! # cove-vmm
//!
//! Hypervisor control layer for Cove sandboxes.
//! Drives Firecracker and Cloud-Hypervisor microVMs through their
//! HTTP-over-unix-socket control APIs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cove_vmm::{Hypervisor, HypervisorConfig, VmState, VmmType};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn example() -> cove_vmm::Result<()> {
//! let config = HypervisorConfig {
//!     vmm_type: VmmType::Firecracker,
//!     kernel_path: "/var/lib/cove/kernels/5.10.186/vmlinux".into(),
//!     rootfs_path: "/var/lib/cove/templates/base/image/rootfs.ext4".into(),
//!     ..Default::default()
//! };
//!
//! // The hypervisor process is already running with --api-sock.
//! let mut vm = Hypervisor::new("sbx-1", Path::new("/run/cove/sbx-1/firecracker.socket"), config);
//! vm.wait_ready(Duration::from_secs(2)).await?;
//! vm.configure().await?;
//! vm.start().await?;
//! assert_eq!(vm.state(), VmState::Running);
//!
//! vm.snapshot(Path::new("/run/cove/sbx-1/snapshot")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle state machine**: configure, start, pause, resume, snapshot, restore
//! - **Two backends**: Firecracker and Cloud-Hypervisor behind one [`Hypervisor`]
//! - **Socket readiness**: file polling plus backoff probing with a hard deadline
//! - **Transient retries**: refused connections and cut-off responses are retried
//! - **Launching**: `unshare` + `ip netns exec` wrapping for hypervisor processes
//! - **Testing**: `mock` feature serves both control APIs in-process

pub mod client;
mod config;
mod error;
mod hypervisor;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod process;
pub mod retry;
mod snapshot;
pub mod socket;

pub use config::{
    HypervisorConfig, MmdsMetadata, NetworkConfig, VmmType, DEFAULT_SETTLE_DELAY, ROOTFS_DRIVE_ID,
    WRITABLE_DRIVE_ID,
};
pub use error::{ConfigPhase, Result, VmError};
pub use hypervisor::{Hypervisor, VmState, RESTORE_MAX_RETRIES};
pub use process::{ChildProcess, CommandLauncher, LaunchSpec, Launcher, VmmProcess};
pub use retry::{retry_request, Backoff};
pub use snapshot::{allocated_bytes, SnapshotFiles, MEMFILE_NAME, SNAPFILE_NAME};
pub use socket::{wait_for_socket, DEFAULT_SOCKET_TIMEOUT};
