use chrono::{DateTime, Utc};
use common::{JobId, JobRecord, JobStatus, TransitionError, EXIT_EXECUTION_FAULT};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ExecutionMode;
use crate::metrics::{
    MetricsCollector, OUTCOME_COMPLETED, OUTCOME_FAILED, OUTCOME_FAULT, OUTCOME_POLICY, OUTCOME_TIMEOUT,
};
use crate::sandbox::{Executor, Termination};
use crate::store::{self, JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What one cycle saw and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started: Vec<JobId>,
    pub completed: usize,
    pub failed: usize,
    /// Selected but claimed elsewhere or no longer approved on re-load.
    pub skipped: usize,
    /// Selected but a store write failed; left for the next cycle.
    pub errors: usize,
    pub pending: usize,
    pub stale: Vec<JobId>,
}

/// RUNNING for longer than `stale_after`. Records without `started_at`
/// predate that field and are measured from creation.
pub fn is_stale(job: &JobRecord, stale_after: Duration, now: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Running {
        return false;
    }
    let since = job.started_at.unwrap_or(job.created_at);
    match chrono::Duration::from_std(stale_after) {
        Ok(limit) => now - since > limit,
        Err(_) => false,
    }
}

/// Releases a per-id claim on every exit path.
struct Claim<'a> {
    claims: &'a DashMap<JobId, ()>,
    id: JobId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

pub struct Dispatcher<E: Executor> {
    store: Arc<dyn JobStore>,
    executor: E,
    metrics: Arc<MetricsCollector>,
    mode: ExecutionMode,
    stale_after: Duration,
    claims: DashMap<JobId, ()>,
}

impl<E: Executor> Dispatcher<E> {
    pub fn new(store: Arc<dyn JobStore>, executor: E, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            store,
            executor,
            metrics,
            mode: ExecutionMode::Sequential,
            stale_after: Duration::from_secs(900),
            claims: DashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// One pass over the queue on behalf of `identity`, starting at most
    /// `max_concurrent - running` approved jobs, oldest first.
    pub async fn run_cycle(&self, identity: &str, max_concurrent: usize) -> Result<CycleReport, StoreError> {
        self.metrics.increment_cycles();
        let now = Utc::now();
        let mut report = CycleReport::default();

        let mut running = 0usize;
        let mut approved = Vec::new();
        for job in store::load_all(self.store.as_ref())? {
            if !job.targets(identity) {
                continue;
            }
            match job.status {
                JobStatus::Approved => approved.push(job),
                JobStatus::Running => {
                    running += 1;
                    if is_stale(&job, self.stale_after, now) {
                        log::warn!(
                            "Job {} ({}) has been running since {:?}, longer than {}s",
                            job.id,
                            job.name,
                            job.started_at,
                            self.stale_after.as_secs()
                        );
                        report.stale.push(job.id.clone());
                    }
                }
                JobStatus::Pending => {
                    log::info!("Job {} ({}) is pending approval", job.id, job.name);
                    report.pending += 1;
                }
                _ => {}
            }
        }
        self.metrics.set_queue_state(approved.len() as u64, running as u64);

        let available = max_concurrent.saturating_sub(running);
        if available == 0 {
            log::debug!("{} job(s) already running for {}, no slots free", running, identity);
            return Ok(report);
        }
        if approved.is_empty() {
            return Ok(report);
        }
        if !self.executor.ready() {
            log::info!("Host resources are low, leaving {} approved job(s) queued", approved.len());
            return Ok(report);
        }

        approved.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        approved.truncate(available);
        log::info!("Dispatching {} job(s) for {}", approved.len(), identity);

        let results = match self.mode {
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(approved.len());
                for job in approved {
                    let id = job.id.clone();
                    results.push((id, self.dispatch(identity, job).await));
                }
                results
            }
            ExecutionMode::Parallel => {
                let ids: Vec<JobId> = approved.iter().map(|j| j.id.clone()).collect();
                let outcomes =
                    futures::future::join_all(approved.into_iter().map(|job| self.dispatch(identity, job))).await;
                ids.into_iter().zip(outcomes).collect()
            }
        };

        for (id, result) in results {
            match result {
                Ok(Some(status)) => {
                    report.started.push(id);
                    if status == JobStatus::Completed {
                        report.completed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    log::error!("Failed to dispatch job {}: {}", id, e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Claims, runs and finalizes one job. `Ok(None)` means someone else got it first.
    async fn dispatch(&self, identity: &str, candidate: JobRecord) -> Result<Option<JobStatus>, DispatchError> {
        let _claim = match self.claims.entry(candidate.id.clone()) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(slot) => {
                slot.insert(());
                Claim {
                    claims: &self.claims,
                    id: candidate.id.clone(),
                }
            }
        };

        let mut job = match self.store.load(&candidate.id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !job.is_eligible_for(identity) {
            log::debug!("Job {} is {} now, skipping", job.id, job.status);
            return Ok(None);
        }

        job.mark_running(Utc::now())?;
        self.store.save(&job)?;
        self.metrics.record_started();
        log::info!("Executing job {} ({}) for {}", job.id, job.name, job.requester_identity);

        let started = Instant::now();
        let run = AssertUnwindSafe(self.executor.run(&job)).catch_unwind().await;
        let (exit_code, logs, outcome) = match run {
            Ok(Ok(output)) => {
                let outcome = match output.termination {
                    Termination::TimedOut => OUTCOME_TIMEOUT,
                    Termination::PolicyRejected => OUTCOME_POLICY,
                    _ if output.exit_code == 0 => OUTCOME_COMPLETED,
                    _ => OUTCOME_FAILED,
                };
                (output.exit_code, output.logs(), outcome)
            }
            Ok(Err(e)) => {
                log::error!("Execution fault in job {}: {}", job.id, e);
                (EXIT_EXECUTION_FAULT, format!("Execution fault: {}", e), OUTCOME_FAULT)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!("Execution of job {} panicked: {}", job.id, message);
                (EXIT_EXECUTION_FAULT, format!("Execution fault: panicked: {}", message), OUTCOME_FAULT)
            }
        };
        self.metrics
            .record_finished(outcome, started.elapsed().as_millis() as u64);
        log::info!(target: "job_output", "Job: {} ({})\n{}", job.name, job.id, logs);

        let status = job.finish(exit_code, logs, Utc::now())?;
        self.store.save(&job)?;
        log::info!("Job {} finished as {} (exit code {})", job.id, status, exit_code);
        Ok(Some(status))
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sandbox::{ExecError, ExecutionOutput};
    use crate::store::tests::{job, t0};
    use crate::store::MemoryJobStore;
    use common::ScriptRef;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Behaviour is picked from the inline script: `exit N`, `fault`, `panic`,
    /// `sleep`, anything else exits 0.
    pub(crate) struct FakeExecutor {
        pub store: Arc<dyn JobStore>,
        pub runs: Mutex<Vec<(JobId, JobStatus)>>,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub ready: bool,
    }

    impl FakeExecutor {
        pub(crate) fn new(store: Arc<dyn JobStore>) -> Self {
            Self {
                store,
                runs: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                ready: true,
            }
        }

        pub(crate) fn run_ids(&self) -> Vec<String> {
            self.runs.lock().unwrap().iter().map(|(id, _)| id.0.clone()).collect()
        }
    }

    impl Executor for FakeExecutor {
        async fn run(&self, job: &JobRecord) -> Result<ExecutionOutput, ExecError> {
            let seen = self.store.load(&job.id).map(|j| j.status).unwrap_or(JobStatus::Pending);
            self.runs.lock().unwrap().push((job.id.clone(), seen));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let script = match &job.script {
                ScriptRef::Inline(body) => body.clone(),
                ScriptRef::Path(_) => String::new(),
            };
            if script == "sleep" {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if script == "panic" {
                panic!("executor blew up");
            }
            if script == "fault" {
                return Err(ExecError::ScriptMissing(PathBuf::from("/gone/run.sh")));
            }
            let exit_code = script
                .strip_prefix("exit ")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            Ok(ExecutionOutput {
                exit_code,
                stdout: format!("ran {}", job.id),
                stderr: String::new(),
                termination: Termination::Exited,
                duration: Duration::from_millis(1),
                pid: Some(1),
            })
        }

        fn ready(&self) -> bool {
            self.ready
        }
    }

    pub(crate) fn scripted(id: &str, target: &str, status: JobStatus, minutes: i64, script: &str) -> JobRecord {
        let mut record = job(id, target, status, minutes);
        record.script = ScriptRef::Inline(script.into());
        record
    }

    fn setup(jobs: Vec<JobRecord>) -> (Arc<dyn JobStore>, Dispatcher<FakeExecutor>) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::with_jobs(jobs));
        let exec = FakeExecutor::new(store.clone());
        let dispatcher = Dispatcher::new(store.clone(), exec, Arc::new(MetricsCollector::new()));
        (store, dispatcher)
    }

    fn status_of(store: &Arc<dyn JobStore>, id: &str) -> JobStatus {
        store.load(&JobId::from(id)).unwrap().status
    }

    #[tokio::test]
    async fn test_oldest_first_up_to_limit() {
        let (store, dispatcher) = setup(vec![
            job("c", "node", JobStatus::Approved, 3),
            job("a", "node", JobStatus::Approved, 1),
            job("b", "node", JobStatus::Approved, 2),
        ]);

        let report = dispatcher.run_cycle("node", 2).await.unwrap();

        assert_eq!(dispatcher.executor().run_ids(), vec!["a", "b"]);
        assert_eq!(report.started, vec![JobId::from("a"), JobId::from("b")]);
        assert_eq!(status_of(&store, "c"), JobStatus::Approved);

        dispatcher.run_cycle("node", 2).await.unwrap();
        assert_eq!(status_of(&store, "c"), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_equal_timestamps_break_ties_by_id() {
        let (_, dispatcher) = setup(vec![
            job("z", "node", JobStatus::Approved, 0),
            job("m", "node", JobStatus::Approved, 0),
        ]);
        dispatcher.run_cycle("node", 1).await.unwrap();
        assert_eq!(dispatcher.executor().run_ids(), vec!["m"]);
    }

    #[tokio::test]
    async fn test_other_identities_are_never_touched() {
        let theirs = job("x", "other-node", JobStatus::Approved, 0);
        let (store, dispatcher) = setup(vec![theirs.clone(), job("y", "node", JobStatus::Approved, 1)]);

        dispatcher.run_cycle("node", 5).await.unwrap();

        assert_eq!(dispatcher.executor().run_ids(), vec!["y"]);
        assert_eq!(store.load(&theirs.id).unwrap(), theirs);
    }

    #[tokio::test]
    async fn test_running_jobs_consume_slots() {
        let mut busy = job("busy", "node", JobStatus::Running, 0);
        busy.started_at = Some(Utc::now());
        let (store, dispatcher) = setup(vec![
            busy,
            job("elsewhere", "other-node", JobStatus::Running, 0),
            job("a", "node", JobStatus::Approved, 1),
            job("b", "node", JobStatus::Approved, 2),
        ]);

        let report = dispatcher.run_cycle("node", 2).await.unwrap();
        assert_eq!(report.started, vec![JobId::from("a")]);
        assert_eq!(status_of(&store, "b"), JobStatus::Approved);

        let (_, full) = setup(vec![
            job("r1", "node", JobStatus::Running, 0),
            job("a", "node", JobStatus::Approved, 1),
        ]);
        let report = full.run_cycle("node", 1).await.unwrap();
        assert!(report.started.is_empty());
        assert!(full.executor().run_ids().is_empty());
    }

    #[tokio::test]
    async fn test_record_is_running_while_executing_and_final_fields_pair_up() {
        let (store, dispatcher) = setup(vec![
            scripted("ok", "node", JobStatus::Approved, 0, "echo"),
            scripted("bad", "node", JobStatus::Approved, 1, "exit 4"),
        ]);

        let report = dispatcher.run_cycle("node", 5).await.unwrap();
        assert_eq!((report.completed, report.failed), (1, 1));

        let seen: Vec<JobStatus> = dispatcher.executor().runs.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(seen, vec![JobStatus::Running, JobStatus::Running]);

        let ok = store.load(&JobId::from("ok")).unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.exit_code, Some(0));
        assert!(ok.completed_at.is_some() && ok.started_at.is_some());
        assert!(ok.logs.unwrap().contains("ran ok"));

        let bad = store.load(&JobId::from("bad")).unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.exit_code, Some(4));
        assert!(bad.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_execution_fault_is_recorded_as_failed() {
        let (store, dispatcher) = setup(vec![scripted("f", "node", JobStatus::Approved, 0, "fault")]);
        dispatcher.run_cycle("node", 1).await.unwrap();

        let record = store.load(&JobId::from("f")).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.exit_code, Some(EXIT_EXECUTION_FAULT));
        assert!(record.logs.unwrap().starts_with("Execution fault: job script not found"));
        assert_eq!(dispatcher.metrics.finished(OUTCOME_FAULT), 1);
    }

    #[tokio::test]
    async fn test_panicking_executor_still_finalizes_the_record() {
        let (store, dispatcher) = setup(vec![
            scripted("boom", "node", JobStatus::Approved, 0, "panic"),
            scripted("next", "node", JobStatus::Approved, 1, "echo"),
        ]);

        let report = dispatcher.run_cycle("node", 2).await.unwrap();
        assert_eq!(report.started, vec![JobId::from("boom"), JobId::from("next")]);
        assert_eq!((report.completed, report.failed), (1, 1));

        let record = store.load(&JobId::from("boom")).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.exit_code, Some(EXIT_EXECUTION_FAULT));
        assert!(record.completed_at.is_some());
        assert_eq!(record.logs.as_deref(), Some("Execution fault: panicked: executor blew up"));
        assert_eq!(dispatcher.metrics.finished(OUTCOME_FAULT), 1);
        assert!(dispatcher.claims.is_empty());
    }

    #[tokio::test]
    async fn test_pending_and_stale_are_only_reported() {
        let mut stale = job("stale", "node", JobStatus::Running, 0);
        stale.started_at = Some(t0());
        let pending = job("p", "node", JobStatus::Pending, 1);
        let (store, dispatcher) = setup(vec![stale.clone(), pending.clone()]);

        let report = dispatcher.run_cycle("node", 3).await.unwrap();

        assert_eq!(report.pending, 1);
        assert_eq!(report.stale, vec![JobId::from("stale")]);
        assert_eq!(store.load(&stale.id).unwrap(), stale);
        assert_eq!(store.load(&pending.id).unwrap(), pending);
    }

    #[tokio::test]
    async fn test_low_resources_defer_everything() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::with_jobs([job("a", "node", JobStatus::Approved, 0)]));
        let mut exec = FakeExecutor::new(store.clone());
        exec.ready = false;
        let dispatcher = Dispatcher::new(store.clone(), exec, Arc::new(MetricsCollector::new()));

        let report = dispatcher.run_cycle("node", 3).await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(status_of(&store, "a"), JobStatus::Approved);
    }

    #[tokio::test]
    async fn test_parallel_mode_runs_selected_jobs_together() {
        let (store, dispatcher) = setup(vec![
            scripted("a", "node", JobStatus::Approved, 0, "sleep"),
            scripted("b", "node", JobStatus::Approved, 1, "sleep"),
            scripted("c", "node", JobStatus::Approved, 2, "sleep"),
            scripted("d", "node", JobStatus::Approved, 3, "sleep"),
        ]);
        let dispatcher = dispatcher.with_mode(ExecutionMode::Parallel);

        let report = dispatcher.run_cycle("node", 3).await.unwrap();

        assert_eq!(report.completed, 3);
        assert_eq!(dispatcher.executor().peak.load(Ordering::SeqCst), 3);
        assert_eq!(status_of(&store, "d"), JobStatus::Approved);
    }

    #[tokio::test]
    async fn test_overlapping_cycles_never_run_a_job_twice() {
        let (store, dispatcher) = setup(vec![
            scripted("a", "node", JobStatus::Approved, 0, "sleep"),
            scripted("b", "node", JobStatus::Approved, 1, "sleep"),
        ]);

        let (first, second) = tokio::join!(dispatcher.run_cycle("node", 5), dispatcher.run_cycle("node", 5));
        let started = first.unwrap().started.len() + second.unwrap().started.len();

        let mut ran = dispatcher.executor().run_ids();
        ran.sort();
        assert_eq!(ran, vec!["a", "b"]);
        assert_eq!(started, 2);
        assert_eq!(status_of(&store, "a"), JobStatus::Completed);
        assert_eq!(status_of(&store, "b"), JobStatus::Completed);
    }

    #[test]
    fn test_is_stale() {
        let mut record = job("r", "node", JobStatus::Running, 0);
        record.started_at = Some(t0());
        let limit = Duration::from_secs(600);
        assert!(!is_stale(&record, limit, t0() + chrono::Duration::minutes(5)));
        assert!(is_stale(&record, limit, t0() + chrono::Duration::minutes(11)));
        record.status = JobStatus::Completed;
        assert!(!is_stale(&record, limit, t0() + chrono::Duration::days(1)));
    }
}
