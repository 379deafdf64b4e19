use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::{JobId, JobRecord, JobStatus};

/// History entry as served to dashboards. Mirrors the record minus script and logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub requester_identity: String,
    pub target_identity: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time: Option<f64>,
    pub exit_code: Option<i32>,
    pub success: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&JobRecord> for JobSummary {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            status: job.status,
            requester_identity: job.requester_identity.clone(),
            target_identity: job.target_identity.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            execution_time: job.execution_time(),
            exit_code: job.exit_code,
            success: job.status == JobStatus::Completed,
            tags: job.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub jobs: Vec<JobSummary>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub running: usize,
    pub pending: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub id: JobId,
    pub name: String,
    pub logs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetailResponse {
    pub job: JobSummary,
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleJob {
    pub id: JobId,
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub app: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub identity: String,
    pub components: BTreeMap<String, String>,
    pub stale_running: Vec<StaleJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub message: String,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
