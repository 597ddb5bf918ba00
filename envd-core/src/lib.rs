//! Process-supervision engine for `envd`.
//!
//! Four components, each its own module:
//!
//! - [`broadcaster`] - output fan-out (BCAST): one pump, many independent
//!   bounded-queue subscribers.
//! - [`fsv`] - jailed filesystem view (FSV): path resolution that never
//!   leaves a fixed root.
//! - [`executor`] - the executor (EXEC): the only component that calls into
//!   the OS process APIs.
//! - [`manager`] - the process manager (PM): handle registry, lifecycle
//!   transitions, and the reconcile loop.
//!
//! [`handle`] holds the `Handle` data model shared by the four components.
//! No HTTP, no JSON, no CLI lives here; those are `envd`'s concern.

pub mod broadcaster;
pub mod executor;
pub mod fsv;
pub mod handle;
pub mod manager;
pub mod process_group;

pub use broadcaster::Broadcaster;
pub use executor::{ExecError, ExecOutput, Spawn, StartedProcess};
pub use fsv::{FileStat, FileSystemView, FsError};
pub use handle::{Handle, HandleId, HandleState, HandleStatus};
pub use manager::{ManagerConfig, ManagerError, ProcessManager, StartRequest, StatusSnapshot};
