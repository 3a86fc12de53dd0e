//! Remote command execution.
//!
//! The transport itself is an opaque capability: run a command on a target,
//! return its output or fail. [`RemoteHost`] binds a transport to one target
//! and applies the single pipeline-wide retry rule: a transport-level error
//! closes and reopens the connection and reissues the command exactly once;
//! a second failure propagates as fatal. Command failures (non-zero exit)
//! are never retried.

use crate::errors::{VmforgeError, VmforgeResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Options for a single remote command.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Suppress output logging for successful runs.
    pub silent: bool,
    /// Return the output instead of failing when the command exits non-zero.
    pub warn_only: bool,
}

/// Captured output of a completed remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with surrounding whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Opaque remote execution capability.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command on the target.
    async fn run(
        &self,
        target: &str,
        command: &str,
        options: &RunOptions,
    ) -> VmforgeResult<CommandOutput>;

    /// Write `content` to a file on the target.
    async fn put(&self, target: &str, content: &[u8], remote_path: &str) -> VmforgeResult<()>;

    /// Tear down any cached connection to the target so the next `run`
    /// starts from a fresh one.
    async fn reset(&self, target: &str) -> VmforgeResult<()>;
}

/// A remote host commands are executed on, with the retry rule applied.
#[derive(Clone)]
pub struct RemoteHost {
    transport: Arc<dyn RemoteTransport>,
    target: String,
}

impl RemoteHost {
    pub fn new(transport: Arc<dyn RemoteTransport>, target: impl Into<String>) -> Self {
        Self {
            transport,
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn run(&self, command: &str) -> VmforgeResult<CommandOutput> {
        self.run_with(command, &RunOptions::default()).await
    }

    pub async fn run_with(
        &self,
        command: &str,
        options: &RunOptions,
    ) -> VmforgeResult<CommandOutput> {
        match self.transport.run(&self.target, command, options).await {
            Err(err) if err.is_transport() => {
                tracing::warn!(
                    target = %self.target,
                    error = %err,
                    "Transport failure, reconnecting for a single retry"
                );
                self.transport.reset(&self.target).await?;
                self.transport.run(&self.target, command, options).await
            }
            other => other,
        }
    }

    /// Read a remote file's contents.
    pub async fn read_file(&self, path: &str) -> VmforgeResult<String> {
        let output = self
            .run_with(
                &format!("cat {path}"),
                &RunOptions {
                    silent: true,
                    warn_only: false,
                },
            )
            .await?;
        Ok(output.stdout)
    }

    pub async fn put(&self, content: &[u8], remote_path: &str) -> VmforgeResult<()> {
        match self.transport.put(&self.target, content, remote_path).await {
            Err(err) if err.is_transport() => {
                tracing::warn!(
                    target = %self.target,
                    error = %err,
                    "Transport failure during upload, reconnecting for a single retry"
                );
                self.transport.reset(&self.target).await?;
                self.transport.put(&self.target, content, remote_path).await
            }
            other => other,
        }
    }
}

/// Transport shelling out to the system `ssh` client with connection
/// multiplexing, so `reset` can drop the shared control connection.
pub struct SshTransport {
    user: String,
    control_path: String,
}

impl SshTransport {
    pub fn new() -> Self {
        Self {
            user: "root".to_string(),
            control_path: "~/.ssh/vmforge-%r@%h:%p".to_string(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path),
            "-o".into(),
            "ControlPersist=60".into(),
        ]
    }

    fn destination(&self, target: &str) -> String {
        format!("{}@{}", self.user, target)
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

// ssh reserves exit status 255 for its own failures; everything else is the
// remote command's status.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run(
        &self,
        target: &str,
        command: &str,
        options: &RunOptions,
    ) -> VmforgeResult<CommandOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg(self.destination(target))
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(target, command, "Running remote command");

        let output = cmd.output().await.map_err(|e| VmforgeError::Transport {
            target: target.to_string(),
            detail: format!("failed to spawn ssh: {e}"),
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_TRANSPORT_EXIT {
            return Err(VmforgeError::Transport {
                target: target.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        };

        if !result.succeeded() && !options.warn_only {
            return Err(VmforgeError::RemoteCommand {
                target: target.to_string(),
                command: command.to_string(),
                exit_code,
            });
        }

        if !options.silent {
            tracing::debug!(target, exit_code, stdout = %result.trimmed(), "Remote command finished");
        }

        Ok(result)
    }

    async fn put(&self, target: &str, content: &[u8], remote_path: &str) -> VmforgeResult<()> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg(self.destination(target))
            .arg("--")
            .arg(format!("cat > {remote_path}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| VmforgeError::Transport {
            target: target.to_string(),
            detail: format!("failed to spawn ssh: {e}"),
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| VmforgeError::Internal(
            "ssh child has no stdin handle".into(),
        ))?;
        stdin.write_all(content).await.map_err(|e| VmforgeError::Transport {
            target: target.to_string(),
            detail: format!("upload interrupted: {e}"),
        })?;
        drop(stdin);

        let output = child.wait_with_output().await.map_err(|e| VmforgeError::Transport {
            target: target.to_string(),
            detail: format!("ssh did not finish: {e}"),
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_TRANSPORT_EXIT {
            return Err(VmforgeError::Transport {
                target: target.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if exit_code != 0 {
            return Err(VmforgeError::RemoteCommand {
                target: target.to_string(),
                command: format!("cat > {remote_path}"),
                exit_code,
            });
        }
        Ok(())
    }

    async fn reset(&self, target: &str) -> VmforgeResult<()> {
        // Closing the control master is best effort; a dead connection
        // already means there is nothing to close.
        let status = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path))
            .arg("-O")
            .arg("exit")
            .arg(self.destination(target))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            tracing::warn!(target, "Could not close control connection: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport whose first `fail_times` runs fail, either at transport
    /// level or as a plain command failure.
    struct FlakyTransport {
        fail_times: usize,
        transport_level: bool,
        runs: AtomicUsize,
        resets: AtomicUsize,
    }

    impl FlakyTransport {
        fn new(fail_times: usize, transport_level: bool) -> Self {
            Self {
                fail_times,
                transport_level,
                runs: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteTransport for FlakyTransport {
        async fn run(
            &self,
            target: &str,
            command: &str,
            _options: &RunOptions,
        ) -> VmforgeResult<CommandOutput> {
            let attempt = self.runs.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                if self.transport_level {
                    return Err(VmforgeError::Transport {
                        target: target.to_string(),
                        detail: "connection reset".into(),
                    });
                }
                return Err(VmforgeError::RemoteCommand {
                    target: target.to_string(),
                    command: command.to_string(),
                    exit_code: 1,
                });
            }
            Ok(CommandOutput {
                stdout: "ok\n".into(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn put(&self, _: &str, _: &[u8], _: &str) -> VmforgeResult<()> {
            Ok(())
        }

        async fn reset(&self, _: &str) -> VmforgeResult<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn transport_error_is_retried_exactly_once() {
        let transport = Arc::new(FlakyTransport::new(1, true));
        let host = RemoteHost::new(Arc::clone(&transport) as Arc<dyn RemoteTransport>, "hv01");

        let output = host.run("uptime").await.unwrap();
        assert!(output.succeeded());
        assert_eq!(transport.runs.load(Ordering::SeqCst), 2);
        assert_eq!(transport.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_transport_failure_is_fatal() {
        let transport = Arc::new(FlakyTransport::new(2, true));
        let host = RemoteHost::new(Arc::clone(&transport) as Arc<dyn RemoteTransport>, "hv01");

        let err = host.run("uptime").await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(transport.runs.load(Ordering::SeqCst), 2);
        assert_eq!(transport.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn command_failure_is_not_retried() {
        let transport = Arc::new(FlakyTransport::new(1, false));
        let host = RemoteHost::new(Arc::clone(&transport) as Arc<dyn RemoteTransport>, "hv01");

        let err = host.run("false").await.unwrap_err();
        assert!(matches!(err, VmforgeError::RemoteCommand { .. }));
        assert_eq!(transport.runs.load(Ordering::SeqCst), 1);
        assert_eq!(transport.resets.load(Ordering::SeqCst), 0);
    }
}
