//! Running external tools and capturing their output.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::SandboxError;
use crate::utils::shell::join_args;

/// Captured output of an external tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `binary args...`, capturing stdout and stderr.
///
/// With a `timeout`, the child is killed once the budget is spent and
/// `SandboxError::Timeout` is returned. A missing binary maps to
/// `MissingDependency`. A non-zero exit is returned as data; callers decide
/// whether it is a failure.
pub async fn run_tool<S: AsRef<str>>(
    binary: &str,
    args: &[S],
    timeout: Option<Duration>,
) -> Result<ToolOutput, SandboxError> {
    tracing::debug!("exec: {} {}", binary, join_args(args.iter().map(|a| a.as_ref())));

    let mut child = Command::new(binary)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::MissingDependency(format!("{} not found in PATH", binary))
            } else {
                SandboxError::Io(e)
            }
        })?;

    // Drain both pipes while waiting so a chatty child cannot block on a full pipe.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let read_out = tokio::spawn(read_pipe(stdout));
    let read_err = tokio::spawn(read_pipe(stderr));

    let status = match timeout {
        Some(budget) => match tokio::time::timeout(budget, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill timed out {}: {}", binary, e);
                }
                read_out.abort();
                read_err.abort();
                return Err(SandboxError::Timeout(budget.as_millis() as u64));
            }
        },
        None => child.wait().await?,
    };

    let stdout = read_out.await.unwrap_or_default();
    let stderr = read_err.await.unwrap_or_default();

    Ok(ToolOutput {
        stdout,
        stderr,
        // Terminated by signal
        exit_code: status.code().unwrap_or(-1),
    })
}

/// Run a tool and turn a non-zero exit into `ExternalToolFailure`.
pub async fn run_tool_checked<S: AsRef<str>>(
    binary: &str,
    args: &[S],
    timeout: Option<Duration>,
) -> Result<ToolOutput, SandboxError> {
    let output = run_tool(binary, args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        let detail = if output.stderr.trim().is_empty() {
            format!("exited with code {}", output.exit_code)
        } else {
            output.stderr.trim().to_string()
        };
        Err(SandboxError::tool_failure(binary, detail))
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
