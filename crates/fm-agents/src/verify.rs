use thiserror::Error;
use tracing::debug;

use fm_core::types::{Criterion, Task};
use fm_core::workspace::{CheckoutHandle, WorkspaceError};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// Outcome of checking one task against its acceptance criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Pass,
    /// One reason per failed criterion, in declaration order. The reasons
    /// are fed back to the agent verbatim on retry.
    Fail(Vec<String>),
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        matches!(self, VerificationResult::Pass)
    }
}

/// Evaluates a task's acceptance criteria inside its working copy.
///
/// Every criterion is checked even after the first failure so a retrying
/// agent sees the full picture at once instead of fixing one criterion per
/// attempt.
pub struct VerificationEngine;

impl VerificationEngine {
    pub async fn verify(task: &Task, handle: &CheckoutHandle) -> Result<VerificationResult> {
        let mut failures = Vec::new();

        for criterion in &task.criteria {
            match criterion {
                Criterion::FileExists { path } => {
                    if !handle.file_exists(path) {
                        failures.push(format!("missing file {path}"));
                    }
                }
                Criterion::CommandSucceeds { command } => {
                    match handle.run_command(command).await {
                        Ok(output) if output.success() => {}
                        Ok(output) => {
                            failures.push(format!("command failed: exit {}", output.exit_code));
                        }
                        // A hung check is a failed criterion, not an
                        // infrastructure error.
                        Err(WorkspaceError::CommandTimeout(secs)) => {
                            failures.push(format!("command timed out after {secs}s"));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            debug!(
                task_id = %task.id,
                criterion = %criterion,
                failed = failures.len(),
                "criterion checked"
            );
        }

        if failures.is_empty() {
            Ok(VerificationResult::Pass)
        } else {
            Ok(VerificationResult::Fail(failures))
        }
    }
}
