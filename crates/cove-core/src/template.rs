//! VM templates.
//!
//! A template is a prepared root filesystem plus the machine shape it was
//! built for. Templates live under the data root:
//!
//! ```text
//! <data_root>/templates/<template_id>/template.toml
//! <data_root>/templates/<template_id>/image/rootfs.ext4
//! <data_root>/templates/<template_id>/image/writable.ext4   (overlay only)
//! <data_root>/templates/<template_id>/run/                  (bind-mount target)
//! <data_root>/templates/<template_id>/snapshot/             (template snapshot)
//! <data_root>/kernels/<kernel_version>/vmlinux
//! ```

use crate::error::Result;
use cove_vmm::VmmType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_KERNEL_VERSION: &str = "5.10.186";

pub const TEMPLATE_FILE_NAME: &str = "template.toml";
pub const ROOTFS_NAME: &str = "rootfs.ext4";
pub const WRITABLE_FS_NAME: &str = "writable.ext4";
pub const KERNEL_NAME: &str = "vmlinux";

const TEMPLATES_DIR: &str = "templates";
const KERNELS_DIR: &str = "kernels";

/// Init the guest runs to assemble its overlay root.
pub const OVERLAY_INIT_PATH: &str = "/sbin/overlay-init";

/// A template failed validation. One variant per violated clause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("invalid vcpu count")]
    InvalidVcpuCount,

    #[error("invalid memory size")]
    InvalidMemSize,

    #[error("invalid disk size")]
    InvalidDiskSize,

    #[error("invalid kernel version")]
    InvalidKernelVersion,

    #[error("invalid vmm type: {0}")]
    InvalidVmmType(String),

    #[error("template not found: {0}")]
    NotFound(String),
}

/// Command the guest runs once booted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartCmd {
    pub cmd: String,
    pub envfile_path: String,
    pub working_dir: String,
}

/// Immutable description of a sandbox image and its machine shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub template_id: String,
    #[serde(default)]
    pub vcpu: u32,
    #[serde(default)]
    pub mem_mb: u32,
    #[serde(default)]
    pub disk_mb: u32,
    #[serde(default = "default_kernel_version")]
    pub kernel_version: String,
    #[serde(default)]
    pub docker_img: String,
    #[serde(default)]
    pub overlay: bool,
    #[serde(default)]
    pub huge_pages: bool,
    /// Kept as text so an unknown value surfaces as [`TemplateError::InvalidVmmType`]
    /// instead of a parse error.
    #[serde(default = "default_vmm_type")]
    pub vmm_type: String,
    #[serde(default)]
    pub start_cmd: StartCmd,
}

fn default_kernel_version() -> String {
    DEFAULT_KERNEL_VERSION.to_string()
}

fn default_vmm_type() -> String {
    VmmType::Firecracker.to_string()
}

impl VmTemplate {
    /// Parse a `template.toml` document.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and validate the template stored under `data_root`.
    pub async fn load(data_root: &Path, template_id: &str) -> Result<Self> {
        let path = template_file_path(data_root, template_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(template_id.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };
        let template = Self::from_toml(&text)?;
        template.validate()?;
        tracing::debug!(template_id, path = %path.display(), "Loaded template");
        Ok(template)
    }

    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Check every clause in order and report the first one violated.
    pub fn validate(&self) -> std::result::Result<(), TemplateError> {
        if self.vcpu == 0 {
            return Err(TemplateError::InvalidVcpuCount);
        }
        if self.mem_mb == 0 {
            return Err(TemplateError::InvalidMemSize);
        }
        if self.disk_mb == 0 {
            return Err(TemplateError::InvalidDiskSize);
        }
        if self.kernel_version.is_empty() {
            return Err(TemplateError::InvalidKernelVersion);
        }
        self.parsed_vmm_type()?;
        Ok(())
    }

    pub fn parsed_vmm_type(&self) -> std::result::Result<VmmType, TemplateError> {
        self.vmm_type
            .parse()
            .map_err(|_| TemplateError::InvalidVmmType(self.vmm_type.clone()))
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    pub fn template_dir(&self, data_root: &Path) -> PathBuf {
        data_root.join(TEMPLATES_DIR).join(&self.template_id)
    }

    pub fn image_dir(&self, data_root: &Path) -> PathBuf {
        self.template_dir(data_root).join("image")
    }

    /// Base rootfs. The read-only lower layer when overlay is on.
    pub fn host_rootfs_path(&self, data_root: &Path) -> PathBuf {
        self.image_dir(data_root).join(ROOTFS_NAME)
    }

    pub fn host_writable_path(&self, data_root: &Path) -> PathBuf {
        self.image_dir(data_root).join(WRITABLE_FS_NAME)
    }

    /// Mount target each hypervisor sees its own sandbox directory at.
    ///
    /// Every sandbox bind-mounts its private files here inside its own
    /// mount namespace, so drive paths are identical across instances and
    /// snapshots taken from one instance restore into another.
    pub fn private_dir(&self, data_root: &Path) -> PathBuf {
        self.template_dir(data_root).join("run")
    }

    pub fn private_rootfs_path(&self, data_root: &Path) -> PathBuf {
        self.private_dir(data_root).join(ROOTFS_NAME)
    }

    pub fn private_writable_path(&self, data_root: &Path) -> PathBuf {
        self.private_dir(data_root).join(WRITABLE_FS_NAME)
    }

    pub fn kernel_path(&self, data_root: &Path) -> PathBuf {
        data_root
            .join(KERNELS_DIR)
            .join(&self.kernel_version)
            .join(KERNEL_NAME)
    }

    pub fn snapshot_dir(&self, data_root: &Path) -> PathBuf {
        self.template_dir(data_root).join("snapshot")
    }

    /// Kernel command line for this template.
    pub fn kernel_args(&self, debug_output: bool) -> String {
        let mut args = vec![
            "reboot=k".to_string(),
            "panic=1".into(),
            "nomodules".into(),
            "ipv6.disable=1".into(),
            "random.trust_cpu=on".into(),
            "pci=off".into(),
            "i8042.nokbd i8042.noaux".into(),
            crate::network::guest_ip_boot_arg(),
        ];
        if debug_output {
            args.push("loglevel=6 console=ttyS0".into());
        } else {
            args.push("loglevel=1 quiet".into());
        }
        if self.overlay {
            args.push(format!("overlay_root=vdb init={OVERLAY_INIT_PATH}"));
        }
        args.join(" ")
    }
}

pub fn template_file_path(data_root: &Path, template_id: &str) -> PathBuf {
    data_root
        .join(TEMPLATES_DIR)
        .join(template_id)
        .join(TEMPLATE_FILE_NAME)
}
