use chrono::{DateTime, Utc};
use common::{JobRecord, JobStatus};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::{self, JobStore, StoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes finished job records once they age past the retention window.
pub struct RetentionSweeper<'a> {
    store: &'a dyn JobStore,
    output_root: Option<PathBuf>,
}

impl<'a> RetentionSweeper<'a> {
    pub fn new(store: &'a dyn JobStore, output_root: Option<PathBuf>) -> Self {
        Self { store, output_root }
    }

    pub fn sweep(&self, retention: Duration) -> Result<SweepReport, StoreError> {
        self.sweep_at(retention, Utc::now())
    }

    pub fn sweep_at(&self, retention: Duration, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        // A window reaching past the representable range expires nothing.
        let Some(cutoff) = cutoff else {
            return Ok(report);
        };

        for job in store::load_all(self.store)? {
            let Some(finished) = finished_at(&job) else {
                continue;
            };
            if finished >= cutoff {
                continue;
            }
            match self.store.delete(&job.id) {
                // Someone else removed it first; still gone.
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    log::debug!("Cleaned up old job: {}", job.id);
                    report.deleted += 1;
                    self.remove_output(&job);
                }
                Err(e) => {
                    log::warn!("Failed to clean up job {}: {}", job.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.deleted > 0 {
            log::info!("Cleaned up {} old job(s)", report.deleted);
        }
        Ok(report)
    }

    fn remove_output(&self, job: &JobRecord) {
        let Some(root) = self.output_root.as_deref() else {
            return;
        };
        let dir = output_dir(root, job);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove output dir {:?}: {}", dir, e),
        }
    }
}

fn output_dir(root: &Path, job: &JobRecord) -> PathBuf {
    root.join(&job.id.0)
}

/// Age reference for a terminal record. Rejections written without a
/// completion time age from creation.
fn finished_at(job: &JobRecord) -> Option<DateTime<Utc>> {
    if !job.is_terminal() {
        return None;
    }
    match (job.completed_at, job.status) {
        (Some(at), _) => Some(at),
        (None, JobStatus::Rejected) => Some(job.created_at),
        (None, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{job, t0};
    use crate::store::{FsJobStore, MemoryJobStore};
    use common::JobId;

    fn finished(id: &str, status: JobStatus, days_ago: i64, now: DateTime<Utc>) -> JobRecord {
        let mut record = job(id, "node", status, 0);
        record.exit_code = Some(if status == JobStatus::Completed { 0 } else { 1 });
        record.completed_at = Some(now - chrono::Duration::days(days_ago));
        record
    }

    fn ids(store: &dyn JobStore) -> Vec<JobId> {
        store.list().unwrap().into_iter().collect()
    }

    #[test]
    fn test_sweeps_only_old_terminal_records() {
        let now = t0() + chrono::Duration::days(100);
        let store = MemoryJobStore::with_jobs([
            finished("old-ok", JobStatus::Completed, 40, now),
            finished("old-fail", JobStatus::Failed, 31, now),
            finished("fresh", JobStatus::Completed, 2, now),
            job("old-approved", "node", JobStatus::Approved, 0),
            job("old-running", "node", JobStatus::Running, 0),
            job("old-rejected", "node", JobStatus::Rejected, 0),
        ]);

        let sweeper = RetentionSweeper::new(&store, None);
        let report = sweeper
            .sweep_at(Duration::from_secs(30 * 86_400), now)
            .unwrap();

        assert_eq!(report, SweepReport { deleted: 3, failed: 0 });
        assert_eq!(
            ids(&store),
            vec![JobId::from("fresh"), JobId::from("old-approved"), JobId::from("old-running")]
        );
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let now = t0() + chrono::Duration::days(10);
        let store = MemoryJobStore::with_jobs([
            finished("a", JobStatus::Completed, 8, now),
            finished("b", JobStatus::Failed, 1, now),
        ]);
        let sweeper = RetentionSweeper::new(&store, None);
        let window = Duration::from_secs(7 * 86_400);

        let first = sweeper.sweep_at(window, now).unwrap();
        let survivors = ids(&store);
        let second = sweeper.sweep_at(window, now).unwrap();

        assert_eq!(first.deleted, 1);
        assert_eq!(second, SweepReport::default());
        assert_eq!(ids(&store), survivors);
    }

    #[test]
    fn test_removes_output_dir_and_skips_corrupt_files() {
        let queue = tempfile::tempdir().unwrap();
        let outputs = tempfile::tempdir().unwrap();
        let store = FsJobStore::open(queue.path()).unwrap();
        let now = t0() + chrono::Duration::days(60);

        let old = finished("old", JobStatus::Completed, 45, now);
        store.save(&old).unwrap();
        std::fs::create_dir_all(outputs.path().join("old")).unwrap();
        std::fs::write(outputs.path().join("old/result.csv"), "1,2").unwrap();
        std::fs::write(queue.path().join("garbage.json"), "[").unwrap();

        let sweeper = RetentionSweeper::new(&store, Some(outputs.path().to_path_buf()));
        let report = sweeper.sweep_at(Duration::from_secs(30 * 86_400), now).unwrap();

        assert_eq!(report.deleted, 1);
        assert!(!outputs.path().join("old").exists());
        assert!(queue.path().join("garbage.json").exists());
    }
}
