//! The executor (EXEC): the only component that actually calls into the OS
//! process APIs. Two modes, mirroring the Go original's `ProcessExecutor`:
//! `exec()` runs a command to completion and buffers its output, `start()`
//! spawns a long-running child wired up for streaming.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::broadcaster::Broadcaster;
use crate::process_group;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("missing command")]
    MissingCommand,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parameters shared by both `exec()` and `start()`.
pub struct Spawn {
    pub command: String,
    pub args: Vec<String>,
    /// Entries are appended to the daemon's own environment, never used to
    /// replace it (SPEC_FULL.md §5, resolving spec.md open question 2).
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

/// Result of a buffered, synchronous [`exec`] call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Set on a non-Exit error (spawn failure, signal without exit info);
    /// `exit_code` is `-1` whenever this is set (spec.md §4.3).
    pub error: Option<String>,
}

/// A successfully spawned, streaming child process.
pub struct StartedProcess {
    pub pid: u32,
    pub stdin_tx: mpsc::Sender<Vec<u8>>,
    pub child: Child,
    /// Set by either pump if `max_output_bytes` was exceeded on that stream
    /// (SPEC_FULL.md §6, resolving spec.md §9 open question 5 as a
    /// supplement). Checked by the manager's wait task after the child
    /// exits so it can be recorded in the handle's `err`.
    pub truncated: Arc<AtomicBool>,
}

fn build_command(spawn: &Spawn) -> Result<Command, ExecError> {
    if spawn.command.is_empty() {
        return Err(ExecError::MissingCommand);
    }
    let mut command = Command::new(&spawn.command);
    command.args(&spawn.args);
    for (key, value) in &spawn.env {
        command.env(key, value);
    }
    match spawn.cwd.as_deref() {
        Some(cwd) if !cwd.is_empty() => {
            command.current_dir(Path::new(cwd));
        }
        _ => {}
    }
    Ok(command)
}

/// Runs `spawn` to completion, buffering stdout/stderr in full. Uses the
/// async `Command::output` so the daemon's worker threads are never blocked
/// on a one-shot run.
///
/// A spawn-side failure (missing binary, permission denied, ...) is a
/// non-Exit error; per spec.md §4.3 it is folded into the returned
/// `ExecOutput` as `{exit_code: -1, error: Some(..)}` rather than
/// propagated as `Err`, matching the original `ProcessExecutor.Exec`'s
/// `ExecResponse{ExitCode: -1, Error: err.Error()}` behavior. `Err` is
/// reserved for request-shape failures caught before spawn (e.g. an empty
/// command).
pub async fn exec(spawn: &Spawn) -> Result<ExecOutput, ExecError> {
    let mut command = build_command(spawn)?;
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    match command.output().await {
        Ok(output) => Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
            error: None,
        }),
        Err(err) => Ok(ExecOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: -1,
            error: Some(err.to_string()),
        }),
    }
}

/// Spawns `spawn` as a long-running child. The child is placed in its own
/// process group before exec (via `pre_exec`) so the manager can later
/// signal the whole group, not just the direct child, on `Kill`. Stdout and
/// stderr readers are spawned immediately, publishing chunks into the
/// supplied broadcasters until EOF.
pub async fn start(
    spawn: &Spawn,
    stdout_bcast: Arc<Broadcaster>,
    stderr_bcast: Arc<Broadcaster>,
    max_output_bytes: Option<u64>,
) -> Result<StartedProcess, ExecError> {
    let mut command = build_command(spawn)?;

    #[cfg(target_os = "linux")]
    let parent_pid = unsafe { libc::getpid() };

    unsafe {
        command.pre_exec(move || {
            process_group::set_process_group()?;
            #[cfg(target_os = "linux")]
            process_group::set_parent_death_signal(parent_pid)?;
            Ok(())
        });
    }

    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("missing child pid"))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(128);
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else {
            return;
        };
        while let Some(bytes) = stdin_rx.recv().await {
            if stdin.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = stdin.flush().await;
        }
    });

    let truncated = Arc::new(AtomicBool::new(false));

    if let Some(stdout) = stdout {
        tokio::spawn(pump(
            BufReader::new(stdout),
            stdout_bcast,
            max_output_bytes,
            truncated.clone(),
        ));
    } else {
        stdout_bcast.close();
    }

    if let Some(stderr) = stderr {
        tokio::spawn(pump(
            BufReader::new(stderr),
            stderr_bcast,
            max_output_bytes,
            truncated.clone(),
        ));
    } else {
        stderr_bcast.close();
    }

    Ok(StartedProcess {
        pid,
        stdin_tx,
        child,
        truncated,
    })
}

/// Reads from `reader` until EOF, publishing each chunk to `bcast`, then
/// closes `bcast`. This is the pump referenced throughout
/// [`crate::manager::ProcessManager`]'s lock-ordering rules: it never holds
/// a manager or handle lock.
///
/// If `limit` is set, stops publishing once the stream's cumulative byte
/// count would exceed it (truncating the final chunk to fit) and sets
/// `truncated`, then closes `bcast` without draining the rest of `reader`.
async fn pump<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    bcast: Arc<Broadcaster>,
    limit: Option<u64>,
    truncated: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 8_192];
    let mut sent: u64 = 0;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = if let Some(limit) = limit {
                    let remaining = limit.saturating_sub(sent);
                    if remaining == 0 {
                        truncated.store(true, Ordering::Relaxed);
                        break;
                    }
                    let take = usize::try_from(remaining).unwrap_or(n).min(n);
                    if take < n {
                        truncated.store(true, Ordering::Relaxed);
                    }
                    &buf[..take]
                } else {
                    &buf[..n]
                };
                sent += chunk.len() as u64;
                bcast.publish(chunk.to_vec());
                if limit.is_some_and(|limit| sent >= limit) && truncated.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    bcast.close();
}
