//! Failure policy around the whole pipeline.
//!
//! The last line of defense, not a substitute for stage-specific handling:
//! an error that escapes the pipeline is handed to a policy selected by the
//! caller. Interactive contexts get the shell / abort / continue choice;
//! automated contexts log and abort.

use crate::errors::{VmforgeError, VmforgeResult};
use console::style;
use inquire::Select;
use std::fmt;

/// Operator decision for an unhandled pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Drop into a diagnostic shell, then ask again.
    Shell,
    /// Abort and propagate the failure.
    Abort,
    /// Continue past the failure.
    Continue,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::Shell => write!(f, "Drop to shell"),
            Recovery::Abort => write!(f, "Abort"),
            Recovery::Continue => write!(f, "Continue"),
        }
    }
}

/// Strategy deciding what to do with an unhandled failure.
pub trait FailurePolicy: Send + Sync {
    fn resolve(&self, error: &VmforgeError) -> VmforgeResult<Recovery>;
}

/// Log and abort. For automated contexts.
pub struct StrictPolicy;

impl FailurePolicy for StrictPolicy {
    fn resolve(&self, _error: &VmforgeError) -> VmforgeResult<Recovery> {
        Ok(Recovery::Abort)
    }
}

/// Present the recovery choice on the terminal.
pub struct InteractivePolicy;

impl FailurePolicy for InteractivePolicy {
    fn resolve(&self, error: &VmforgeError) -> VmforgeResult<Recovery> {
        eprintln!("{}", style(format!("Build failed: {error}")).red().bold());
        Select::new(
            "What do you want to do?",
            vec![Recovery::Shell, Recovery::Abort, Recovery::Continue],
        )
        .prompt()
        .map_err(|e| VmforgeError::Aborted(format!("prompt closed: {e}")))
    }
}

/// Apply a policy to a finished build result. `Shell` spawns the operator's
/// shell and asks again afterwards.
pub async fn guard_build<T>(
    policy: &dyn FailurePolicy,
    result: VmforgeResult<T>,
) -> VmforgeResult<Option<T>> {
    let error = match result {
        Ok(value) => return Ok(Some(value)),
        Err(error) => error,
    };
    tracing::error!(%error, "Build failed");

    loop {
        match policy.resolve(&error)? {
            Recovery::Abort => return Err(error),
            Recovery::Continue => return Ok(None),
            Recovery::Shell => open_shell().await?,
        }
    }
}

async fn open_shell() -> VmforgeResult<()> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
    tracing::info!(%shell, "Dropping to a diagnostic shell");
    let status = tokio::process::Command::new(&shell)
        .status()
        .await
        .map_err(|e| VmforgeError::Internal(format!("cannot spawn {shell}: {e}")))?;
    tracing::debug!(code = status.code(), "Shell exited");
    Ok(())
}
