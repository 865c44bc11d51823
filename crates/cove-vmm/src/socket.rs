//! Readiness probing for a hypervisor's control socket.
//!
//! The hypervisor creates its API socket some time after the process is
//! spawned, and even once the file exists the listener may refuse
//! connections for a while. [`wait_for_socket`] covers both windows: it
//! polls for the file, then calls a liveness probe with exponential backoff
//! until the probe succeeds or the deadline passes.

use crate::error::{Result, VmError};
use crate::retry::Backoff;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// How often to look for the socket file.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default readiness deadline for a freshly spawned hypervisor.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait until `socket_path` exists and `probe` succeeds.
///
/// Returns the first successful probe result. Fails with
/// [`VmError::Timeout`] exactly when `timeout` elapses, with
/// [`VmError::Cancelled`] when `cancel` fires, and immediately with
/// [`VmError::Io`] if the path cannot be stat'ed for any reason other than
/// not existing yet.
pub async fn wait_for_socket<T, F, Fut>(
    socket_path: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let deadline = start + timeout;

    tracing::debug!(
        socket = %socket_path.display(),
        timeout_ms = timeout.as_millis() as u64,
        "Waiting for control socket"
    );

    loop {
        match std::fs::metadata(socket_path) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(socket = %socket_path.display(), error = %e, "Cannot stat control socket");
                return Err(VmError::Io(e));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            _ = sleep_until(deadline) => return Err(VmError::Timeout(timeout)),
            _ = sleep(SOCKET_POLL_INTERVAL) => {}
        }
    }

    tracing::trace!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Control socket file appeared"
    );

    let mut backoff = Backoff::default();
    let mut retry_times = 0u32;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            _ = sleep_until(deadline) => return Err(VmError::Timeout(timeout)),
            outcome = probe() => outcome,
        };

        match outcome {
            Ok(value) => {
                tracing::debug!(
                    retry_times,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Control socket ready"
                );
                return Ok(value);
            }
            Err(e) => {
                retry_times += 1;
                tracing::trace!(retry_times, error = %e, "Control socket probe failed");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            _ = sleep_until(deadline) => {
                tracing::warn!(
                    socket = %socket_path.display(),
                    retry_times,
                    "Control socket not ready before deadline"
                );
                return Err(VmError::Timeout(timeout));
            }
            _ = sleep(delay) => {}
        }
    }
}
