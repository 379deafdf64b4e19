use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Approved,
    Rejected,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Approved,
        JobStatus::Rejected,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Rejected | JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges of the job lifecycle. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Approved => "approved",
            JobStatus::Rejected => "rejected",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let wanted = s.trim().to_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("Unknown job status: {}", s))
    }
}

/// Where the code of a job lives. Owned by the submitter; the runner only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScriptRef {
    /// A directory holding `run.sh` (plus any files it needs), or a single script file.
    Path(PathBuf),
    Inline(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal transition for job {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub requester_identity: String,
    pub target_identity: String,
    pub status: JobStatus,
    #[serde(rename = "script_reference")]
    pub script: ScriptRef,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub logs: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly submitted record. Submission happens upstream; this exists for
    /// tooling and tests that need to seed a queue.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        requester: impl Into<String>,
        target: impl Into<String>,
        script: ScriptRef,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId(id.into()),
            name: name.into(),
            requester_identity: requester.into(),
            target_identity: target.into(),
            status: JobStatus::Pending,
            script,
            description: None,
            tags: Vec::new(),
            exit_code: None,
            logs: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn targets(&self, identity: &str) -> bool {
        self.target_identity == identity
    }

    pub fn is_eligible_for(&self, identity: &str) -> bool {
        self.status == JobStatus::Approved && self.targets(identity)
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Final write of an execution: exit code, logs and completion time land together.
    pub fn finish(
        &mut self,
        exit_code: i32,
        logs: String,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, TransitionError> {
        let next = if exit_code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.transition(next)?;
        self.exit_code = Some(exit_code);
        self.logs = Some(logs);
        self.completed_at = Some(now);
        Ok(next)
    }

    pub fn execution_time(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> JobRecord {
        JobRecord::new(
            "job-1",
            "count rows",
            "alice@example.org",
            "node@example.org",
            ScriptRef::Inline("echo hi".into()),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_only_forward_edges_are_allowed() {
        use JobStatus::*;
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let expected = matches!(
                    (from, to),
                    (Pending, Approved)
                        | (Pending, Rejected)
                        | (Approved, Running)
                        | (Running, Completed)
                        | (Running, Failed)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
        for status in [Rejected, Completed, Failed] {
            assert!(JobStatus::ALL.iter().all(|next| !status.can_transition_to(*next)));
        }
    }

    #[test]
    fn test_finish_sets_exit_code_and_completion_together() {
        let mut job = record();
        job.status = JobStatus::Approved;
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();
        job.mark_running(start).unwrap();
        assert_eq!(job.exit_code, None);
        assert_eq!(job.completed_at, None);

        let end = start + chrono::Duration::seconds(90);
        let status = job.finish(3, "boom".into(), end).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(3));
        assert_eq!(job.completed_at, Some(end));
        assert_eq!(job.execution_time(), Some(90.0));
    }

    #[test]
    fn test_skipping_running_is_rejected() {
        let mut job = record();
        job.status = JobStatus::Approved;
        let err = job.finish(0, String::new(), Utc::now()).unwrap_err();
        assert_eq!(err.from, JobStatus::Approved);
        assert_eq!(err.to, JobStatus::Completed);
        assert_eq!(job.status, JobStatus::Approved);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_pending_cannot_be_started() {
        let mut job = record();
        assert!(job.mark_running(Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::json!({
            "id": "abc",
            "name": "train",
            "requester_identity": "r@x",
            "target_identity": "t@x",
            "status": "approved",
            "script_reference": {"kind": "path", "value": "/data/jobs/abc"},
            "created_at": "2025-03-01T10:00:00Z"
        });
        let job: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(job.status, JobStatus::Approved);
        assert_eq!(job.script, ScriptRef::Path(PathBuf::from("/data/jobs/abc")));
        assert!(job.tags.is_empty());
        assert!(job.is_eligible_for("t@x"));
        assert!(!job.is_eligible_for("r@x"));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
        assert!("done".parse::<JobStatus>().is_err());
    }
}
