//! Session cleanup.
//!
//! Stages record how to reverse what they did in a shared [`Ledger`]. The
//! [`CleanupTask`] owned by the orchestrator unwinds it newest-first when the
//! session ends, whichever way it ends. On start the task also removes
//! leftovers of earlier sessions that were killed before cleaning up.

mod error;
pub mod ledger;
pub mod stale;
pub mod task;

pub use error::{CleanupError, CleanupResult};
pub use ledger::{unwind, CleanupExecutor, CleanupReport, Ledger, SystemCleanup, UndoStep};
pub use stale::cleanup_stale_pid_files;
pub use task::CleanupTask;
