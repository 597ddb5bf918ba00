//! The `Handle` data model: one entry per process the manager is tracking.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broadcaster::Broadcaster;
use crate::fsv::FileSystemView;

/// Opaque identifier for a tracked process. Generated by the manager on
/// `Start`, never chosen by the caller.
pub type HandleId = String;

/// Lifecycle state of a tracked process (spec.md §3, §4.4 state machine).
///
/// `Running -> Exited` is the common path. `Running -> Killed -> Exited` is
/// the path taken when a caller (or a timeout) requests termination before
/// the child exits on its own; once `Killed`, the termination transition
/// never overwrites it back to `Exited` (normative choice, spec.md §9 open
/// question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Running,
    Killed,
    Exited,
}

impl HandleState {
    /// `Killed` and `Exited` are both terminal, eviction-pending states per
    /// the §4.4 state diagram; only `Running` is not.
    pub fn is_terminal(self) -> bool {
        matches!(self, HandleState::Exited | HandleState::Killed)
    }

    /// The wire-format string for this state (spec.md §9 re-architecture
    /// item "state-as-string constants").
    pub fn as_wire_str(self) -> &'static str {
        match self {
            HandleState::Running => "running",
            HandleState::Killed => "killed",
            HandleState::Exited => "exited",
        }
    }
}

/// Mutable fields of a [`Handle`] guarded by the handle's own lock, so
/// updates never require holding the manager's registry lock (I7: manager ->
/// handle lock ordering, never the reverse).
#[derive(Debug, Default)]
pub struct HandleStatus {
    pub state_slot: Option<HandleState>,
    pub exit_code: Option<i32>,
    pub err: Option<String>,
}

/// A single tracked process: identity, spawn parameters, pipes to the child,
/// output broadcasters, and the mutable status slot.
pub struct Handle {
    pub id: HandleId,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: String,
    pub pid: u32,

    /// Write-only byte sink to the child's stdin. `None` once closed by the
    /// termination transition (I4: closed exactly once).
    stdin: Mutex<Option<mpsc::Sender<Vec<u8>>>>,

    pub stdout_bcast: Arc<Broadcaster>,
    pub stderr_bcast: Arc<Broadcaster>,

    /// FSV rooted at `<base>/<id>/`.
    pub fs: FileSystemView,

    pub status: Mutex<HandleStatus>,
}

impl Handle {
    pub fn new(
        id: HandleId,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: String,
        pid: u32,
        stdin: mpsc::Sender<Vec<u8>>,
        stdout_bcast: Arc<Broadcaster>,
        stderr_bcast: Arc<Broadcaster>,
        fs: FileSystemView,
    ) -> Self {
        Self {
            id,
            command,
            args,
            env,
            cwd,
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout_bcast,
            stderr_bcast,
            fs,
            status: Mutex::new(HandleStatus::default()),
        }
    }

    pub fn state(&self) -> HandleState {
        self.status.lock().state_slot.unwrap_or(HandleState::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.lock().exit_code
    }

    pub fn err(&self) -> Option<String> {
        self.status.lock().err.clone()
    }

    /// Attempts to hand `data` to the stdin writer task. Fails with `None`
    /// if the process is not running or stdin has already been closed;
    /// callers distinguish those two cases via [`Handle::state`] first, per
    /// the manager's WriteInput protocol.
    pub async fn write_stdin(&self, data: Vec<u8>) -> Result<(), ()> {
        let sender = self.stdin.lock().clone();
        match sender {
            Some(tx) => tx.send(data).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.lock().is_some()
    }

    /// Closes stdin (idempotent) and applies the termination transition to
    /// `state`/`exit_code`/`err`: `Killed` is sticky, everything else becomes
    /// `Exited` (spec.md §4.4, §9 open question 1).
    pub fn mark_exited(&self, exit_code: i32, err: Option<String>) {
        self.stdin.lock().take();

        let mut status = self.status.lock();
        status.exit_code = Some(exit_code);
        if err.is_some() {
            status.err = err;
        }
        status.state_slot = Some(match status.state_slot {
            Some(HandleState::Killed) => HandleState::Killed,
            _ => HandleState::Exited,
        });
    }

    /// Records that a kill was requested. No-op if already `Killed` or
    /// terminal (Kill is idempotent per spec.md §4.4).
    pub fn mark_killed(&self) {
        let mut status = self.status.lock();
        if status.state_slot.is_none() || status.state_slot == Some(HandleState::Running) {
            status.state_slot = Some(HandleState::Killed);
        }
    }
}
