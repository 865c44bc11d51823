//! Error types for cove-core.

use crate::template::TemplateError;
use thiserror::Error;

/// Result type alias for cove-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from cove-vmm
    #[error("VM error: {0}")]
    Vm(#[from] cove_vmm::VmError),

    /// Template missing or failed validation
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Sandbox not found
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// Id unusable as a sandbox name
    #[error("invalid sandbox id: {0:?}")]
    InvalidId(String),

    /// A live sandbox already uses this id
    #[error("sandbox already exists: {0}")]
    AlreadyExists(String),

    /// Another lifecycle operation holds the sandbox
    #[error("sandbox busy: {0}")]
    Busy(String),

    /// Every network slot is taken
    #[error("network slots exhausted (max {0})")]
    NetworkExhausted(u32),

    /// Device or namespace setup failed
    #[error("network error: {0}")]
    Network(String),

    /// Signalling or inspecting a host process failed
    #[error("process error: {0}")]
    Process(String),

    /// Gave up waiting
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Several independent failures from a bulk operation
    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<CoreError>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Template file did not parse
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn join_errors(errors: &[CoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// Collapse a list of failures: none is `Ok`, one is itself.
    pub fn aggregate(mut errors: Vec<CoreError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CoreError::Aggregate(errors)),
        }
    }
}
