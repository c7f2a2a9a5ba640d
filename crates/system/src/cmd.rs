//! Helpers for shelling out to system tooling.

use common::{Error, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Run a command, returning its stdout on success.
///
/// A non-zero exit status is an error carrying the command line and stderr.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "running command");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::other(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command with the given bytes piped to stdin.
pub async fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<String> {
    debug!(program, ?args, bytes = input.len(), "running command with stdin");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::other(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
