//! External collaborator process invocation.
//!
//! Every external stage (image transforms, trainer commands, augmentation)
//! is a synchronous child-process call; a non-zero exit is fatal for the
//! invoking stage.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

/// A collaborator process exited unsuccessfully or failed to launch.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    #[error("'{program}' exited with status {code:?}")]
    NonZeroExit { program: String, code: Option<i32> },
}

/// Runs a collaborator command to completion, inheriting stdio.
pub async fn run_command(
    program: &str,
    args: &[String],
    envs: &[(&str, String)],
) -> Result<(), ProcessError> {
    info!(program, args = ?args, "Invoking collaborator");
    let mut command = tokio::process::Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    let status = command.status().await.map_err(|source| ProcessError::Launch {
        program: program.to_string(),
        source,
    })?;
    if !status.success() {
        return Err(ProcessError::NonZeroExit {
            program: program.to_string(),
            code: status.code(),
        });
    }
    debug!(program, "Collaborator finished");
    Ok(())
}

/// Formats a path argument for a collaborator command line.
pub fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
