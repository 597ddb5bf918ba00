//! The process manager (PM): the only component callers (the HTTP layer)
//! talk to directly. Owns the handle registry, drives `Start`/`Kill`, and
//! runs the background reconcile loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::executor::{self, ExecError, ExecOutput, Spawn};
use crate::fsv::FileSystemView;
use crate::handle::{Handle, HandleId, HandleState};
use crate::process_group::{self, KillSignal};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("process not found")]
    NotFound,
    #[error("process is not running")]
    NotRunning,
    #[error("stdin is not available for this process")]
    StdinUnavailable,
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tunables for [`ProcessManager::new`], sourced from `envd`'s CLI flags
/// (SPEC_FULL.md §9.3).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub base_dir: PathBuf,
    pub subscriber_capacity: usize,
    pub reconcile_interval: Duration,
    pub max_output_bytes: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/envd"),
            subscriber_capacity: 16,
            reconcile_interval: Duration::from_millis(2000),
            max_output_bytes: None,
        }
    }
}

/// A `Start` request, as the manager sees it. The HTTP layer translates its
/// wire-format `ExecRequest` into this before calling [`ProcessManager::start`].
pub struct StartRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// Optional supervised timeout; `None` or `Some(0)` disables it
    /// (SPEC_FULL.md §6, resolving spec.md §9 open question 3).
    pub timeout_ms: Option<u64>,
}

/// Point-in-time view of a handle, returned by [`ProcessManager::status`].
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub id: HandleId,
    pub command: String,
    pub args: Vec<String>,
    pub pid: u32,
    pub state: HandleState,
    pub exit_code: Option<i32>,
    pub err: Option<String>,
}

pub struct ProcessManager {
    config: ManagerConfig,
    registry: PlMutex<HashMap<HandleId, Arc<Handle>>>,
    /// Tripped by [`ProcessManager::shutdown`] to stop the reconcile loop
    /// (spec.md §4.4 "must be cancellable and terminate on shutdown", §9
    /// re-architecture item "context propagation for shutdown").
    reconcile_cancel: CancellationToken,
}

impl ProcessManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            registry: PlMutex::new(HashMap::new()),
            reconcile_cancel: CancellationToken::new(),
        });
        manager.clone().spawn_reconcile_loop();
        manager
    }

    /// Implements the Start protocol of spec.md §4.4: spawn first, then
    /// allocate the per-process directory; if the directory fails, the
    /// already-spawned child is killed and the error surfaces with no
    /// handle created.
    pub async fn start(self: &Arc<Self>, req: StartRequest) -> Result<HandleId, ManagerError> {
        let stdout_bcast = Arc::new(Broadcaster::new(self.config.subscriber_capacity));
        let stderr_bcast = Arc::new(Broadcaster::new(self.config.subscriber_capacity));

        let spawn = Spawn {
            command: req.command.clone(),
            args: req.args.clone(),
            env: req.env.clone(),
            cwd: req.cwd.clone(),
        };

        let started = executor::start(
            &spawn,
            stdout_bcast.clone(),
            stderr_bcast.clone(),
            self.config.max_output_bytes,
        )
        .await?;

        let id = Uuid::new_v4().to_string();
        let fs_root = self.config.base_dir.join(&id);
        if let Err(err) = tokio::fs::create_dir_all(&fs_root).await {
            let _ = process_group::kill_process_group_by_pid_with_signal(
                started.pid,
                KillSignal::Kill,
            );
            return Err(err.into());
        }

        let handle = Arc::new(Handle::new(
            id.clone(),
            req.command,
            req.args,
            req.env,
            req.cwd.unwrap_or_default(),
            started.pid,
            started.stdin_tx,
            stdout_bcast,
            stderr_bcast,
            FileSystemView::new(fs_root),
        ));

        self.registry.lock().insert(id.clone(), handle.clone());

        let wait_handle = handle.clone();
        let mut child = started.child;
        let truncated = started.truncated;
        tokio::spawn(async move {
            let (exit_code, mut err) = match child.wait().await {
                Ok(status) => (status.code().unwrap_or(-1), None),
                Err(e) => (-1, Some(e.to_string())),
            };
            if truncated.load(std::sync::atomic::Ordering::Relaxed) {
                let note = "output truncated: exceeded max_output_bytes".to_string();
                err = Some(match err {
                    Some(existing) => format!("{existing}; {note}"),
                    None => note,
                });
            }
            wait_handle.mark_exited(exit_code, err);
            wait_handle.stdout_bcast.close();
            wait_handle.stderr_bcast.close();
        });

        if let Some(timeout_ms) = req.timeout_ms.filter(|ms| *ms > 0) {
            let manager = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if manager.handle_state(&id) == Some(HandleState::Running) {
                    let _ = manager.kill(&id, false).await;
                    tokio::time::sleep(Duration::from_millis(
                        process_group::DEFAULT_GRACEFUL_TIMEOUT_MS,
                    ))
                    .await;
                    let _ = manager.kill(&id, true).await;
                }
            });
        }

        Ok(id)
    }

    /// Runs `spawn` to completion synchronously; never registers a handle.
    pub async fn exec(&self, req: StartRequest) -> Result<ExecOutput, ManagerError> {
        let spawn = Spawn {
            command: req.command,
            args: req.args,
            env: req.env,
            cwd: req.cwd,
        };
        Ok(executor::exec(&spawn).await?)
    }

    fn handle_state(&self, id: &str) -> Option<HandleState> {
        self.registry.lock().get(id).map(|h| h.state())
    }

    pub fn status(&self, id: &str) -> Result<StatusSnapshot, ManagerError> {
        let handle = self.handle(id)?;
        Ok(StatusSnapshot {
            id: handle.id.clone(),
            command: handle.command.clone(),
            args: handle.args.clone(),
            pid: handle.pid,
            state: handle.state(),
            exit_code: handle.exit_code(),
            err: handle.err(),
        })
    }

    /// Looks up a handle by id. Returns "not found" both for ids the
    /// manager never saw and for ids already evicted by the reconcile loop
    /// (I1: a handle is in the registry iff not yet reconciled).
    pub fn handle(&self, id: &str) -> Result<Arc<Handle>, ManagerError> {
        self.registry
            .lock()
            .get(id)
            .cloned()
            .ok_or(ManagerError::NotFound)
    }

    pub async fn write_input(&self, id: &str, data: Vec<u8>) -> Result<(), ManagerError> {
        let handle = self.handle(id)?;
        if handle.state() != HandleState::Running {
            return Err(ManagerError::NotRunning);
        }
        if !handle.has_stdin() {
            return Err(ManagerError::StdinUnavailable);
        }
        handle
            .write_stdin(data)
            .await
            .map_err(|_| ManagerError::StdinUnavailable)
    }

    /// Sends SIGTERM (`force == false`) or SIGKILL (`force == true`) to the
    /// whole process group. Idempotent: killing an already-terminal handle
    /// is a no-op, not an error, matching spec.md §4.4's Kill semantics.
    pub async fn kill(&self, id: &str, force: bool) -> Result<(), ManagerError> {
        let handle = self.handle(id)?;
        if handle.state() != HandleState::Running {
            return Ok(());
        }
        handle.mark_killed();

        let signal = if force {
            KillSignal::Kill
        } else {
            KillSignal::Term
        };
        process_group::kill_process_group_by_pid_with_signal(handle.pid, signal)?;
        Ok(())
    }

    /// Force-kills every still-running process. Does not wait synchronously
    /// for reaping: the wait tasks run their termination transitions
    /// normally once released (spec.md §4.4 Shutdown). Also stops the
    /// reconcile loop.
    pub async fn shutdown(&self) {
        self.reconcile_cancel.cancel();
        let handles: Vec<Arc<Handle>> = self.registry.lock().values().cloned().collect();
        for handle in handles {
            if handle.state() == HandleState::Running {
                handle.mark_killed();
                let _ = process_group::kill_process_group_by_pid_with_signal(
                    handle.pid,
                    KillSignal::Kill,
                );
            }
        }
    }

    /// Background tick (default period 2s) that evicts terminal handles
    /// from the registry and best-effort removes their per-process
    /// filesystem root (SPEC_FULL.md §6, resolving spec.md §9 open question
    /// 4 as a supplement; the Go original leaks the directory). Cancelled by
    /// [`ProcessManager::shutdown`] via `reconcile_cancel`.
    fn spawn_reconcile_loop(self: Arc<Self>) {
        let interval = self.config.reconcile_interval;
        let cancel = self.reconcile_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let terminal: Vec<Arc<Handle>> = {
                    let mut registry = self.registry.lock();
                    let ids: Vec<HandleId> = registry
                        .iter()
                        .filter(|(_, h)| h.state().is_terminal())
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| registry.remove(&id))
                        .collect()
                };
                for handle in terminal {
                    let root = handle.fs.root().to_path_buf();
                    if let Err(err) = tokio::fs::remove_dir_all(&root).await {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(
                                process_id = %handle.id,
                                error = %err,
                                "failed to remove per-process filesystem root"
                            );
                        }
                    }
                }
            }
        });
    }
}
