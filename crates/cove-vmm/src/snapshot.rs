//! On-disk snapshot artifacts.

use crate::config::VmmType;
use crate::error::Result;
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Guest memory image file name.
pub const MEMFILE_NAME: &str = "memfile";

/// Machine state file name.
pub const SNAPFILE_NAME: &str = "snapfile";

/// Cloud-Hypervisor picks its own names inside the destination directory.
const CH_MEMORY_NAME: &str = "memory-ranges";
const CH_STATE_NAME: &str = "state.json";

/// The pair of files a snapshot consists of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFiles {
    pub dir: PathBuf,
    pub memfile: PathBuf,
    pub snapfile: PathBuf,
}

impl SnapshotFiles {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            memfile: dir.join(MEMFILE_NAME),
            snapfile: dir.join(SNAPFILE_NAME),
            dir,
        }
    }

    /// File layout the given hypervisor produces in `dir`.
    pub fn for_vmm(vmm_type: VmmType, dir: impl AsRef<Path>) -> Self {
        match vmm_type {
            VmmType::Firecracker => Self::in_dir(dir),
            VmmType::CloudHypervisor => {
                let dir = dir.as_ref().to_path_buf();
                Self {
                    memfile: dir.join(CH_MEMORY_NAME),
                    snapfile: dir.join(CH_STATE_NAME),
                    dir,
                }
            }
        }
    }

    /// Both files are present.
    pub fn exists(&self) -> bool {
        self.memfile.is_file() && self.snapfile.is_file()
    }

    /// Disk blocks actually backing the memfile, in bytes.
    ///
    /// Diff snapshots only write touched pages, so this is well below the
    /// apparent file size.
    pub fn memfile_allocated_bytes(&self) -> Result<u64> {
        Ok(allocated_bytes(&self.memfile)?)
    }

    /// Apparent memfile size in bytes.
    pub fn memfile_len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.memfile)?.len())
    }
}

/// Allocated size of a file; `st_blocks` is always in 512-byte units.
pub fn allocated_bytes(path: &Path) -> std::io::Result<u64> {
    Ok(std::fs::metadata(path)?.blocks() * 512)
}
