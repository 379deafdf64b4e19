use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::dispatcher::{panic_message, CycleReport, Dispatcher};
use crate::metrics::MetricsCollector;
use crate::retention::{RetentionSweeper, SweepReport};
use crate::sandbox::Executor;
use crate::store::JobStore;

/// Drives dispatcher cycles for one node identity, followed by a retention sweep.
pub struct Runner<E: Executor> {
    dispatcher: Dispatcher<E>,
    store: Arc<dyn JobStore>,
    metrics: Arc<MetricsCollector>,
    identity: String,
    max_concurrent: usize,
    retention: Duration,
    output_root: Option<PathBuf>,
    cycle_lock: Mutex<()>,
}

impl<E: Executor> Runner<E> {
    pub fn new(
        dispatcher: Dispatcher<E>,
        store: Arc<dyn JobStore>,
        metrics: Arc<MetricsCollector>,
        identity: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            dispatcher,
            store,
            metrics,
            identity: identity.into(),
            max_concurrent,
            retention: Duration::from_secs(30 * 86_400),
            output_root: None,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_retention(mut self, retention: Duration, output_root: Option<PathBuf>) -> Self {
        self.retention = retention;
        self.output_root = output_root;
        self
    }

    /// One cycle plus a sweep. Returns the cycle report, or `None` when the
    /// cycle faulted (the fault is logged, never propagated).
    pub async fn run_once(&self) -> Option<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;

        let cycle = AssertUnwindSafe(self.dispatcher.run_cycle(&self.identity, self.max_concurrent))
            .catch_unwind()
            .await;
        let report = match cycle {
            Ok(Ok(report)) => {
                if !report.started.is_empty() {
                    log::info!(
                        "Cycle finished: {} completed, {} failed",
                        report.completed,
                        report.failed
                    );
                }
                Some(report)
            }
            Ok(Err(e)) => {
                log::error!("Dispatcher cycle failed: {}", e);
                self.metrics.record_cycle_fault();
                None
            }
            Err(panic) => {
                log::error!("Dispatcher cycle panicked: {}", panic_message(panic.as_ref()));
                self.metrics.record_cycle_fault();
                None
            }
        };

        if let Err(e) = self.sweep(self.retention).await {
            log::warn!("Retention sweep failed: {}", e);
        }
        report
    }

    /// Repeats [`Runner::run_once`] every `interval` until `shutdown` flips to
    /// true or its sender goes away. An in-flight cycle always finishes.
    pub async fn run_forever(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "Dispatcher loop started for {} (every {}s, max {} concurrent)",
            self.identity,
            interval.as_secs(),
            self.max_concurrent
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Dispatcher loop stopped");
    }

    /// Retention sweep off the async threads.
    pub async fn sweep(&self, retention: Duration) -> anyhow::Result<SweepReport> {
        let store = self.store.clone();
        let output_root = self.output_root.clone();
        let report = tokio::task::spawn_blocking(move || {
            RetentionSweeper::new(store.as_ref(), output_root).sweep(retention)
        })
        .await??;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{scripted, FakeExecutor};
    use crate::store::tests::job;
    use crate::store::MemoryJobStore;
    use chrono::Utc;
    use common::{JobId, JobStatus};

    fn runner(jobs: Vec<common::JobRecord>) -> (Arc<dyn JobStore>, Arc<MetricsCollector>, Runner<FakeExecutor>) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::with_jobs(jobs));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = Dispatcher::new(store.clone(), FakeExecutor::new(store.clone()), metrics.clone());
        let runner = Runner::new(dispatcher, store.clone(), metrics.clone(), "node", 2);
        (store, metrics, runner)
    }

    #[tokio::test]
    async fn test_run_once_dispatches_then_sweeps() {
        let mut old = job("old", "node", JobStatus::Completed, 0);
        old.exit_code = Some(0);
        old.completed_at = Some(Utc::now() - chrono::Duration::days(40));
        let (store, _, runner) = runner(vec![old, job("new", "node", JobStatus::Approved, 1)]);

        let report = runner.run_once().await.unwrap();

        assert_eq!(report.started, vec![JobId::from("new")]);
        let ids: Vec<_> = store.list().unwrap().into_iter().collect();
        assert_eq!(ids, vec![JobId::from("new")]);
    }

    #[tokio::test]
    async fn test_panicking_job_is_failed_and_cycle_carries_on() {
        let (store, metrics, runner) = runner(vec![
            scripted("boom", "node", JobStatus::Approved, 0, "panic"),
            scripted("next", "node", JobStatus::Approved, 5, "echo"),
        ]);

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.started, vec![JobId::from("boom"), JobId::from("next")]);
        assert!(metrics.export().contains("sandrun_cycle_faults_total 0\n"));

        let boom = store.load(&JobId::from("boom")).unwrap();
        assert_eq!(boom.status, JobStatus::Failed);
        assert_eq!(boom.exit_code, Some(common::EXIT_EXECUTION_FAULT));
        assert!(boom.completed_at.is_some());
        assert_eq!(store.load(&JobId::from("next")).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_shutdown() {
        let (store, _, runner) = runner(vec![job("a", "node", JobStatus::Approved, 0)]);
        let runner = Arc::new(runner);
        let (tx, rx) = watch::channel(false);

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_forever(Duration::from_millis(20), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(store.load(&JobId::from("a")).unwrap().status, JobStatus::Completed);
    }
}
