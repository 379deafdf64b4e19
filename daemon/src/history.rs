use chrono::{DateTime, Utc};
use common::{JobId, JobRecord, JobStats, JobStatus, JobSummary, LogsResponse, StaleJob};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::is_stale;
use crate::retention::{RetentionSweeper, SweepReport};
use crate::store::{self, JobStore, StoreError, StoreResult};

/// Read-side view of the queue for a single node identity.
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn JobStore>,
    identity: String,
    output_root: Option<PathBuf>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn JobStore>, identity: impl Into<String>, output_root: Option<PathBuf>) -> Self {
        Self {
            store,
            identity: identity.into(),
            output_root,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn mine(&self) -> StoreResult<Vec<JobRecord>> {
        let mut jobs = store::load_all(self.store.as_ref())?;
        jobs.retain(|j| j.targets(&self.identity));
        Ok(jobs)
    }

    /// Most recently created first.
    pub fn history(&self, limit: usize, status: Option<JobStatus>) -> StoreResult<Vec<JobSummary>> {
        let mut jobs = self.mine()?;
        if let Some(status) = status {
            jobs.retain(|j| j.status == status);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(jobs.iter().take(limit).map(JobSummary::from).collect())
    }

    pub fn stats(&self) -> StoreResult<JobStats> {
        let mut stats = JobStats::default();
        for job in self.mine()? {
            match job.status {
                JobStatus::Completed => stats.successful += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Rejected => stats.rejected += 1,
                JobStatus::Approved => {}
            }
        }
        stats.total = stats.successful + stats.failed;
        stats.success_rate = success_rate(stats.successful, stats.total);
        Ok(stats)
    }

    /// Record for `id`, provided it belongs to this node.
    pub fn job(&self, id: &JobId) -> StoreResult<JobRecord> {
        let job = self.store.load(id)?;
        if !job.targets(&self.identity) {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(job)
    }

    pub fn logs(&self, id: &JobId) -> StoreResult<LogsResponse> {
        let job = self.job(id)?;
        Ok(LogsResponse {
            id: job.id,
            name: job.name,
            logs: job.logs.unwrap_or_else(|| "No logs available".to_string()),
        })
    }

    pub fn stale_running(&self, stale_after: Duration, now: DateTime<Utc>) -> StoreResult<Vec<StaleJob>> {
        let mut stale: Vec<StaleJob> = self
            .mine()?
            .into_iter()
            .filter(|j| is_stale(j, stale_after, now))
            .map(|j| StaleJob {
                id: j.id,
                name: j.name,
                started_at: j.started_at,
            })
            .collect();
        stale.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(stale)
    }

    /// Deletes terminal records finished more than `older_than_days` ago.
    pub fn cleanup(&self, older_than_days: u32) -> StoreResult<SweepReport> {
        let window = Duration::from_secs(u64::from(older_than_days) * 86_400);
        RetentionSweeper::new(self.store.as_ref(), self.output_root.clone()).sweep(window)
    }
}

/// Percentage rounded to two decimals, 0.0 for an empty history.
fn success_rate(successful: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (successful as f64 / total as f64 * 10_000.0).round() / 100.0
}
