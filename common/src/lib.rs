pub mod api;
pub mod duration;
pub mod job;

pub use api::{
    CleanupResponse, ErrorResponse, HistoryResponse, JobDetailResponse, JobStats, JobSummary,
    LogsResponse, StaleJob, StatusResponse,
};
pub use duration::{format_duration, parse_duration};
pub use job::{JobId, JobRecord, JobStatus, ScriptRef, TransitionError};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sandrun/config.yaml";
pub const DEFAULT_QUEUE_DIR: &str = "/var/lib/sandrun/jobs";

// Fallback paths for non-root users
pub const USER_QUEUE_DIR: &str = "sandrun-jobs";

pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8085";

/// Name of the entrypoint looked up inside a job folder.
pub const ENTRYPOINT: &str = "run.sh";

// Synthetic exit codes. Real processes only produce 0..=255.
pub const EXIT_EXECUTION_FAULT: i32 = -1;
pub const EXIT_TIMEOUT: i32 = -2;
pub const EXIT_POLICY_VIOLATION: i32 = -3;
