//! Subprocess execution for kernel utilities
//!
//! All kernel state changes go through the canonical command-line utilities
//! (`ipset`, `iptables`, `ip6tables`, `ip`). Every invocation carries a
//! cancellation token; when it fires the subprocess is killed and the call
//! returns `NetfilterError::Cancelled`.

use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::error::{NetfilterError, NetfilterResult};

/// Run a command and return its trimmed stdout.
///
/// Non-zero exit status becomes `NetfilterError::CommandFailed` carrying the
/// full command line and captured stderr.
pub async fn run(
    cancel: &CancellationToken,
    program: &str,
    args: &[&str],
) -> NetfilterResult<String> {
    let command_line = format_command(program, args);
    trace!(command = %command_line, "exec");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| NetfilterError::SpawnFailed {
            command: command_line.clone(),
            source: e,
        })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| NetfilterError::SpawnFailed {
            command: command_line.clone(),
            source: e,
        })?,
        () = cancel.cancelled() => {
            // kill_on_drop reaps the child when the future is dropped here
            return Err(NetfilterError::Cancelled {
                command: command_line,
            });
        }
    };

    if !output.status.success() {
        return Err(NetfilterError::CommandFailed {
            command: command_line,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command for its side effect, discarding stdout.
pub async fn run_silent(
    cancel: &CancellationToken,
    program: &str,
    args: &[&str],
) -> NetfilterResult<()> {
    run(cancel, program, args).await.map(|_| ())
}

fn format_command(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}
