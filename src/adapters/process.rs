//! Subprocess plumbing shared by the command-line collaborators.

use std::io::ErrorKind as IoErrorKind;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::error::CollaboratorError;

/// Run `program` with `args`, piping `stdin` in and collecting output.
///
/// The child is killed if the returned future is dropped, so a stage
/// timeout never leaves orphaned processes behind. A missing binary is
/// `BackendMissing`; a non-zero exit is returned as-is for the caller to
/// classify.
pub async fn run_command(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<Output, CollaboratorError> {
    debug!(program, ?args, "Spawning subprocess");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            IoErrorKind::NotFound => {
                CollaboratorError::BackendMissing(format!("'{}' is not installed", program))
            }
            _ => CollaboratorError::Unavailable(format!("failed to spawn '{}': {}", program, e)),
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await.map_err(|e| {
            CollaboratorError::Unavailable(format!("failed to write to '{}' stdin: {}", program, e))
        })?;
        // Dropping the pipe signals EOF
    }

    child
        .wait_with_output()
        .await
        .map_err(|e| CollaboratorError::Unavailable(format!("failed to wait for '{}': {}", program, e)))
}

/// Short description of a failed process for error messages
pub fn describe_failure(program: &str, output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);
    format!(
        "'{}' failed with exit code {}: {}",
        program,
        exit_code,
        super::truncate(stderr.trim(), 500)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_permanent() {
        let err = run_command("medibrief-no-such-binary", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backend_missing");
        assert!(!err.is_transient());
    }
}
