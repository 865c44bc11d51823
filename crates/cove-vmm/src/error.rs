//! Error types for cove-vmm.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cove-vmm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Step of the configure sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPhase {
    BootSource,
    Drives,
    Network,
    Mmds,
    Machine,
    /// Cloud-Hypervisor takes the whole VM description in one call.
    CreateVm,
}

impl fmt::Display for ConfigPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPhase::BootSource => write!(f, "boot-source"),
            ConfigPhase::Drives => write!(f, "drives"),
            ConfigPhase::Network => write!(f, "network"),
            ConfigPhase::Mmds => write!(f, "mmds"),
            ConfigPhase::Machine => write!(f, "machine-config"),
            ConfigPhase::CreateVm => write!(f, "vm.create"),
        }
    }
}

/// Errors that can occur while driving a hypervisor.
#[derive(Debug, Error)]
pub enum VmError {
    /// The HTTP exchange over the control socket failed
    #[error("control socket request failed: {0}")]
    Transport(#[from] hyper::Error),

    /// Request could not be built
    #[error("invalid control request: {0}")]
    Request(#[from] hyper::http::Error),

    /// Hypervisor answered with a non-2xx status
    #[error("hypervisor API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// A configure step failed; earlier steps are not rolled back
    #[error("configure failed at {phase}: {source}")]
    Configure {
        phase: ConfigPhase,
        #[source]
        source: Box<VmError>,
    },

    /// Operation is not allowed in the current lifecycle state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Diff snapshots need dirty page tracking enabled at configure time
    #[error("snapshot precondition failed: {0}")]
    SnapshotPrecondition(String),

    /// Deadline reached
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Transient failures outlasted the retry budget
    #[error("max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<VmError>,
    },

    /// Hypervisor process could not be launched or signalled
    #[error("hypervisor process error: {0}")]
    Process(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VmError {
    /// Tag an error with the configure step it came from.
    pub(crate) fn at(phase: ConfigPhase) -> impl FnOnce(VmError) -> VmError {
        move |source| VmError::Configure {
            phase,
            source: Box::new(source),
        }
    }

    /// Whether this failure is worth retrying.
    ///
    /// Only a connection refused by the socket or a response cut off before
    /// it completed qualify. Everything else, including API errors, is final.
    pub fn is_transient(&self) -> bool {
        match self {
            VmError::Transport(e) => {
                if e.is_incomplete_message() {
                    return true;
                }
                let mut source = e.source();
                while let Some(err) = source {
                    if let Some(io_err) = err.downcast_ref::<io::Error>() {
                        return is_transient_io(io_err);
                    }
                    source = err.source();
                }
                false
            }
            VmError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_transient_classification() {
        let refused = VmError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        let eof = VmError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        let missing = VmError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(refused.is_transient());
        assert!(eof.is_transient());
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_api_error_is_final() {
        let err = VmError::Api {
            status: 400,
            message: "bad drive".into(),
        };
        assert!(!err.is_transient());
        assert!(!VmError::Cancelled.is_transient());
    }

    #[test]
    fn test_configure_error_names_phase() {
        let err = VmError::at(ConfigPhase::Drives)(VmError::Api {
            status: 400,
            message: "no such file".into(),
        });
        assert_eq!(
            err.to_string(),
            "configure failed at drives: hypervisor API returned 400: no such file"
        );
    }
}
