//! Shell command execution utilities.
//!
//! Commands run through `/bin/sh -c` with every interpolated value passed
//! through [`shellquote`]. Each invocation is bounded by a timeout; a child
//! that outlives it is killed and reported as [`AgentError::Timeout`].
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use vpnv4_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set {} up", IP_CMD, shellquote("alpha-1234"));
//! let result = shell::exec(&cmd, Duration::from_secs(30)).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{AgentError, AgentResult};

/// Path to the `ip` command for link and route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the FRR reload helper.
pub const FRR_RELOAD_CMD: &str = "/usr/lib/frr/frr-reload.py";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\`
/// and newline.
///
/// # Example
///
/// ```
/// use vpnv4_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// assert_eq!(shellquote("with\"quote"), "\"with\\\"quote\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output, trimmed.
    pub stdout: String,
    /// The stderr output, trimmed.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously, bounded by `timeout`.
///
/// Returns `Ok` with the exit status for any command that ran to completion,
/// including non-zero exits. Spawn failures and timeouts are errors.
pub async fn exec(cmd: &str, timeout: Duration) -> AgentResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(output) => output.map_err(|e| AgentError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?,
        Err(_) => {
            tracing::warn!(command = %cmd, timeout_secs = timeout.as_secs(), "Command timed out");
            return Err(AgentError::Timeout {
                operation: cmd.to_string(),
                timeout,
            });
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
///
/// Returns the trimmed stdout on success.
pub async fn exec_or_throw(cmd: &str, timeout: Duration) -> AgentResult<String> {
    let result = exec(cmd, timeout).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(AgentError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
