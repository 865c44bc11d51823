//! Launching and signalling hypervisor processes.
//!
//! Every hypervisor runs as
//! `unshare -pfm --kill-child -- bash -c "<mounts> ip netns exec <ns> <vmm>"`,
//! so it gets private pid and mount namespaces, lives in the sandbox's
//! network namespace, and dies together with the `unshare` parent. The
//! recognisable shape of that command line is also what orphan scanning
//! matches on.

use crate::config::VmmType;
use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Quote `word` for a POSIX shell. Words made only of safe characters
/// are returned as is.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "/._-+:=@,%".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', "'\\''")))
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy()).into_owned()
}

/// What to run for one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub sandbox_id: String,
    pub vmm_type: VmmType,
    pub binary_path: PathBuf,
    pub socket_path: PathBuf,
    /// Network namespace to enter before exec'ing the hypervisor.
    pub netns: Option<String>,
    /// `(source, target)` pairs bind-mounted inside the private mount namespace.
    pub bind_mounts: Vec<(PathBuf, PathBuf)>,
}

impl LaunchSpec {
    /// The bare hypervisor invocation.
    pub fn vmm_command(&self) -> String {
        let mut cmd = format!(
            "{} {} {}",
            quote_path(&self.binary_path),
            self.vmm_type.api_socket_flag(),
            quote_path(&self.socket_path)
        );
        if self.vmm_type == VmmType::CloudHypervisor {
            cmd.push_str(" -v");
        }
        cmd
    }

    /// Script handed to `bash -c`.
    pub fn shell_script(&self) -> String {
        let mut script = String::new();
        for (source, target) in &self.bind_mounts {
            script.push_str(&format!(
                "mount --bind {} {} && ",
                quote_path(source),
                quote_path(target)
            ));
        }
        if let Some(netns) = &self.netns {
            script.push_str(&format!("ip netns exec {} ", shell_quote(netns)));
        }
        script.push_str(&self.vmm_command());
        script
    }

    /// Full argv, program first.
    pub fn argv(&self) -> Vec<String> {
        vec![
            "unshare".into(),
            "-pfm".into(),
            "--kill-child".into(),
            "--".into(),
            "bash".into(),
            "-c".into(),
            self.shell_script(),
        ]
    }
}

/// Handle to a running hypervisor.
#[async_trait]
pub trait VmmProcess: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking check whether the process is gone.
    fn has_exited(&mut self) -> bool;

    /// Kill and reap. Killing an already exited process is not an error.
    async fn kill(&mut self) -> Result<()>;
}

/// Starts hypervisor processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn VmmProcess>>;
}

/// Launches real processes through `unshare`.
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn VmmProcess>> {
        let argv = spec.argv();
        tracing::debug!(
            sandbox_id = %spec.sandbox_id,
            script = %spec.shell_script(),
            "Launching hypervisor"
        );

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(sandbox_id = %spec.sandbox_id, error = %e, "Failed to spawn hypervisor");
                VmError::Process(format!("spawn {}: {e}", argv[0]))
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.sandbox_id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.sandbox_id.clone(), "stderr", stderr);
        }

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            pid = child.id(),
            vmm = %spec.vmm_type,
            "Hypervisor process started"
        );

        Ok(Box::new(ChildProcess {
            sandbox_id: spec.sandbox_id.clone(),
            child,
        }))
    }
}

fn forward_output<R>(sandbox_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(sandbox_id = %sandbox_id, stream, "{line}");
        }
    });
}

/// A hypervisor spawned by [`CommandLauncher`].
#[derive(Debug)]
pub struct ChildProcess {
    sandbox_id: String,
    child: Child,
}

#[async_trait]
impl VmmProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn kill(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        tracing::debug!(sandbox_id = %self.sandbox_id, pid = self.child.id(), "Killing hypervisor");
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(VmError::Process(format!("kill: {e}"))),
        }
    }
}
