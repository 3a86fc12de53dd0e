//! Error types for the provisioning pipeline.

use thiserror::Error;

/// Errors that can occur while building a virtual machine.
#[derive(Debug, Error)]
pub enum VmforgeError {
    /// Bad or ambiguous inventory data. Fatal, raised pre-flight.
    #[error("configuration error: {0}")]
    Config(String),

    /// Addressing resolution failure. Recoverable via the manual fallback,
    /// otherwise fatal.
    #[error("network error: {0}")]
    Network(String),

    /// Transport-level remote execution failure (connection lost, host
    /// unreachable). Eligible for the single automatic reset-and-retry.
    #[error("transport error to {target}: {detail}")]
    Transport { target: String, detail: String },

    /// A remote command ran and failed. Not retried.
    #[error("remote command failed on {target} (exit {exit_code}): {command}")]
    RemoteCommand {
        target: String,
        command: String,
        exit_code: i32,
    },

    /// Target server is in a reserved or otherwise unusable state. Fatal,
    /// raised pre-flight.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Storage provisioning or teardown failure on the hypervisor.
    #[error("storage error: {0}")]
    Storage(String),

    /// Hypervisor capacity or lifecycle failure.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// The operator declined to continue.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A pipeline stage read state an earlier stage failed to populate.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmforgeError {
    /// Whether this error is a transport-level failure, i.e. the remote end
    /// was never reached. Only these qualify for the automatic retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, VmforgeError::Transport { .. })
    }
}

pub type VmforgeResult<T> = Result<T, VmforgeError>;
