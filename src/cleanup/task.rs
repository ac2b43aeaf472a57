//! The cleanup task owned by a running session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ledger::{unwind, CleanupExecutor, CleanupReport, Ledger};

/// Background task that sweeps leftovers from earlier sessions on start and
/// unwinds this session's ledger once released.
///
/// Dropping the task without calling [`CleanupTask::release`] still releases
/// it; the unwind then runs detached for as long as the runtime lives.
pub struct CleanupTask {
    release_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<CleanupReport>>,
}

impl CleanupTask {
    /// Spawn the task on the current runtime.
    pub fn spawn(ledger: Ledger, executor: Arc<dyn CleanupExecutor>) -> Self {
        let (release_tx, mut release_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let sweeper = executor.clone();
            let swept = match tokio::task::spawn_blocking(move || sweeper.sweep_stale()).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Stale resource sweep panicked: {}", e);
                    0
                }
            };
            if swept > 0 {
                info!("Removed {} leftover(s) from previous sessions", swept);
            }

            // A dropped sender counts as a release.
            while !*release_rx.borrow_and_update() {
                if release_rx.changed().await.is_err() {
                    break;
                }
            }

            debug!("Cleanup released, undoing {} step(s)", ledger.len());
            let unwound = tokio::task::spawn_blocking(move || unwind(&ledger, executor.as_ref()));
            let mut report = match unwound.await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Cleanup panicked: {}", e);
                    CleanupReport {
                        failed: vec![e.to_string()],
                        ..Default::default()
                    }
                }
            };
            report.swept = swept;
            report
        });

        Self {
            release_tx,
            handle: Some(handle),
        }
    }

    /// Release the task and wait up to `timeout` for it to finish.
    ///
    /// Returns `None` when the task did not finish in time or failed.
    pub async fn release(mut self, timeout: Duration) -> Option<CleanupReport> {
        let _ = self.release_tx.send(true);
        let handle = self.handle.take()?;

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(report)) => {
                if report.is_clean() {
                    info!("Cleanup finished: {} step(s) undone", report.undone);
                } else {
                    warn!(
                        "Cleanup finished with {} failure(s): {}",
                        report.failed.len(),
                        report.failed.join("; ")
                    );
                }
                Some(report)
            }
            Ok(Err(e)) => {
                warn!("Cleanup task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Cleanup did not finish within {}s", timeout.as_secs());
                None
            }
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        let _ = self.release_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::error::CleanupResult;
    use crate::cleanup::ledger::UndoStep;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counting {
        undone: Mutex<Vec<UndoStep>>,
        sweeps: AtomicUsize,
    }

    impl CleanupExecutor for Counting {
        fn undo(&self, step: &UndoStep) -> CleanupResult<()> {
            self.undone.lock().unwrap().push(step.clone());
            Ok(())
        }

        fn sweep_stale(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            3
        }
    }

    #[tokio::test]
    async fn test_release_unwinds_steps_recorded_after_spawn() {
        let ledger = Ledger::new();
        let executor = Arc::new(Counting::default());
        let task = CleanupTask::spawn(ledger.clone(), executor.clone());

        ledger.record(UndoStep::delete("deployment", "shadow", "dev"));
        ledger.record(UndoStep::delete("service", "mesh", "dev"));

        let report = task.release(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.undone, 2);
        assert_eq!(report.swept, 3);
        assert_eq!(executor.sweeps.load(Ordering::SeqCst), 1);

        let undone = executor.undone.lock().unwrap();
        assert_eq!(undone[0], UndoStep::delete("service", "mesh", "dev"));
    }

    #[tokio::test]
    async fn test_drop_releases_task() {
        let ledger = Ledger::new();
        let executor = Arc::new(Counting::default());
        ledger.record(UndoStep::delete("deployment", "shadow", "dev"));

        drop(CleanupTask::spawn(ledger.clone(), executor.clone()));

        for _ in 0..100 {
            if !executor.undone.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(executor.undone.lock().unwrap().len(), 1);
        assert!(ledger.is_empty());
    }
}
