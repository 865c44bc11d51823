//! # cove-core
//!
//! Sandbox orchestration layer for Cove microVM sandboxes.
//!
//! Turns templates on disk into running microVMs, each with its own
//! network namespace, private disk and hypervisor process, and keeps a
//! registry of them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    cove-core (host)                      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxManager  │────▶│  HashMap<String,         │    │
//! │  │   - create()    │     │        Arc<Sandbox>>     │    │
//! │  │   - delete()    │     └──────────────────────────┘    │
//! │  │   - snapshot()  │                                     │
//! │  │   - purge()     │     ┌──────────────────────────┐    │
//! │  └─────────────────┘────▶│  SlotPool + NetworkDriver│    │
//! │           │              │  (netns, veth, tap, nat) │    │
//! │           ▼              └──────────────────────────┘    │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │    Sandbox      │────▶│   Hypervisor             │    │
//! │  │  (lane mutex)   │     │   (from cove-vmm)        │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//!                           │ unix socket
//!                           ▼
//!            firecracker / cloud-hypervisor process
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cove_core::{ManagerConfig, SandboxManager};
//!
//! # async fn example() -> cove_core::Result<()> {
//! let manager = SandboxManager::with_host_defaults(ManagerConfig::new(
//!     "/var/lib/cove",
//!     "/run/cove",
//! ));
//! manager.reconcile().await?;
//!
//! let sandbox = manager.create("python-3.11", "sbx-1").await?;
//! println!("guest reachable at {}", sandbox.host_ip);
//!
//! let files = manager.snapshot("sbx-1", true).await?;
//! manager
//!     .create_from_snapshot("python-3.11", "sbx-2", &files.dir)
//!     .await?;
//! manager.delete("sbx-2").await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod manager;
pub mod monitor;
pub mod network;
pub mod orphan;
mod sandbox;
pub mod template;

pub use config::{ManagerConfig, DEFAULT_LOG_COLLECTOR_PORT};
pub use error::{CoreError, Result};
pub use manager::{BulkOutcome, PurgeKind, PurgeReport, PurgeTarget, SandboxManager};
pub use monitor::{RegistryMonitor, RegistryStats};
pub use network::{IpCommandDriver, NetworkDriver, NetworkSlot, SlotPool, MAX_SLOT_INDEX};
pub use orphan::VmmProcessInfo;
pub use sandbox::{validate_sandbox_id, Sandbox, SandboxSummary, MAX_SANDBOX_ID_LEN};
pub use template::{TemplateError, VmTemplate};
