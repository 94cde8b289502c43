//! Execution of the user-provided post-change script.

use std::{os::unix::fs::PermissionsExt, path::Path};

use tokio::process::Command;
use tracing::{debug, error};

/// Runs `script`: directly when it carries an execute bit, through `sh`
/// otherwise. Output is captured for debugging and failures are logged, not
/// propagated.
pub async fn execute(script: &Path) {
    debug!("executing script from {}", script.display());

    let directly_executable = match tokio::fs::metadata(script).await {
        Ok(meta) => meta.permissions().mode() & 0o111 != 0,
        Err(err) => {
            error!("unable to stat script {}: {err}", script.display());
            return;
        },
    };

    let mut command = if directly_executable {
        Command::new(script)
    } else {
        let mut command = Command::new("sh");
        command.arg(script);
        command
    };

    match command.output().await {
        Ok(output) => {
            debug!("script stdout: {}", String::from_utf8_lossy(&output.stdout));
            debug!("script stderr: {}", String::from_utf8_lossy(&output.stderr));
            if !output.status.success() {
                error!("script {} failed with {}", script.display(), output.status);
            }
        },
        Err(err) => error!("failed to run script {}: {err}", script.display()),
    }
}
