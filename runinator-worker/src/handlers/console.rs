//! Console handlers: run the task configuration as a command line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::registry::{Handler, HandlerOutcome};

/// Runs the configuration through a command interpreter.
///
/// The child's stdio is captured. The interpreter is placed in its own
/// process group so a timeout kills the whole group, not just the shell;
/// commands that background grandchildren must not outlive the budget.
#[derive(Debug, Clone)]
pub struct ConsoleHandler {
    program: &'static str,
    args: &'static [&'static str],
}

impl ConsoleHandler {
    /// The OS shell: `sh -c` on unix, `cmd /C` on Windows.
    #[must_use]
    pub fn shell() -> Self {
        #[cfg(windows)]
        {
            Self {
                program: "cmd",
                args: &["/C"],
            }
        }
        #[cfg(not(windows))]
        {
            Self {
                program: "sh",
                args: &["-c"],
            }
        }
    }

    /// A PowerShell-style interpreter: `powershell` on Windows, `pwsh`
    /// elsewhere.
    #[must_use]
    pub fn powershell() -> Self {
        #[cfg(windows)]
        {
            Self {
                program: "powershell",
                args: &["-Command"],
            }
        }
        #[cfg(not(windows))]
        {
            Self {
                program: "pwsh",
                args: &["-Command"],
            }
        }
    }
}

#[async_trait]
impl Handler for ConsoleHandler {
    async fn invoke(&self, configuration: &[u8], timeout: Duration) -> HandlerOutcome {
        let Ok(command_line) = std::str::from_utf8(configuration) else {
            return HandlerOutcome::Failure {
                message: "configuration is not valid UTF-8".into(),
                retryable: false,
            };
        };

        tracing::debug!(interpreter = self.program, command = command_line, "spawning");
        let mut command = Command::new(self.program);
        command
            .args(self.args)
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // A fresh process group: the shell's own children stay reachable
        // for the timeout kill.
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return HandlerOutcome::Failure {
                    message: format!("failed to spawn {}: {err}", self.program),
                    retryable: false,
                };
            }
        };
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    HandlerOutcome::Success {
                        stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    HandlerOutcome::Failure {
                        message: format!("{}: {}", output.status, stderr.trim()),
                        retryable: false,
                    }
                }
            }
            Ok(Err(err)) => HandlerOutcome::Failure {
                message: format!("failed to collect child output: {err}"),
                retryable: true,
            },
            Err(_) => {
                // Dropping the wait future kills the shell via
                // kill_on_drop; the group kill reaps anything it spawned.
                kill_process_group(pid);
                HandlerOutcome::Timeout
            }
        }
    }
}

/// SIGKILL the child's whole process group. A cooperative signal to the
/// shell alone would leave backgrounded commands running past the budget.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let killed = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if killed != 0 {
        tracing::debug!(pid, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
