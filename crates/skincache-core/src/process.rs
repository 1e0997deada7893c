//! External tool execution with a deadline.
//!
//! A tool call either completes, or at its deadline the whole process group
//! is killed and reaped before `TimedOut` is returned. Nothing is left
//! running behind a returned error.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ToolConfig;

const PIPE_GRACE: Duration = Duration::from_secs(1);

/// A fully specified tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub wrapper: Option<String>,
    pub args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new(tool: &ToolConfig) -> Self {
        Self {
            program: tool.program.clone(),
            wrapper: tool.wrapper.clone(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// argv as executed, wrapper first.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(wrapper) = &self.wrapper {
            argv.push(OsString::from(wrapper));
        }
        argv.push(self.program.clone().into_os_string());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn display(&self) -> String {
        self.argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a completed tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Diagnostic text for error reports: stderr, or stdout if stderr is empty.
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// Errors from running a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolRunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("waiting on {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `invocation`, killing it if it has not exited within `timeout`.
pub async fn run_with_deadline(
    invocation: &ToolInvocation,
    timeout: Duration,
) -> Result<ToolOutput, ToolRunError> {
    let start = Instant::now();
    let argv = invocation.argv();
    let program = argv[0].to_string_lossy().into_owned();

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    debug!(command = %invocation.display(), timeout_secs = timeout.as_secs(), "Spawning tool");
    let mut child = command.spawn().map_err(|source| ToolRunError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            terminate(&mut child).await;
            stdout.abort();
            stderr.abort();
            return Err(ToolRunError::Wait { program, source });
        }
        Err(_) => {
            warn!(command = %invocation.display(), timeout_secs = timeout.as_secs(), "Tool deadline expired, killing");
            terminate(&mut child).await;
            stdout.abort();
            stderr.abort();
            return Err(ToolRunError::TimedOut { program, timeout });
        }
    };

    // A leftover grandchild may still hold the pipes open.
    let grace = timeout.saturating_sub(start.elapsed()).max(PIPE_GRACE);
    let stdout = collect(stdout, grace).await;
    let stderr = collect(stderr, grace).await;

    Ok(ToolOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

async fn collect(handle: JoinHandle<Vec<u8>>, grace: Duration) -> Vec<u8> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Kill the child's process group (the child itself elsewhere) and reap it.
async fn terminate(child: &mut Child) {
    kill_group(child);
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Reaping killed tool failed");
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    if let Some(pid) = child.id() {
        // The child was spawned as the leader of its own group, so the
        // negated pid addresses the wrapper and everything it started.
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}
