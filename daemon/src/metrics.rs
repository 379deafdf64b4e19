use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Outcome labels used for `sandrun_jobs_finished_total`.
pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_TIMEOUT: &str = "timeout";
pub const OUTCOME_POLICY: &str = "policy_rejected";
pub const OUTCOME_FAULT: &str = "fault";

const KEPT_DURATIONS: usize = 100;

/// Metrics collector for Prometheus-compatible output
pub struct MetricsCollector {
    cycles: Arc<AtomicU64>,
    cycle_faults: Arc<AtomicU64>,
    jobs_started: Arc<AtomicU64>,
    jobs_finished: Arc<DashMap<&'static str, AtomicU64>>,
    job_durations: Arc<Mutex<Vec<u64>>>, // Last durations in ms, for percentiles
    approved_depth: Arc<AtomicU64>,
    running_jobs: Arc<AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            cycles: Arc::new(AtomicU64::new(0)),
            cycle_faults: Arc::new(AtomicU64::new(0)),
            jobs_started: Arc::new(AtomicU64::new(0)),
            jobs_finished: Arc::new(DashMap::new()),
            job_durations: Arc::new(Mutex::new(Vec::new())),
            approved_depth: Arc::new(AtomicU64::new(0)),
            running_jobs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn increment_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_fault(&self) {
        self.cycle_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self, outcome: &'static str, duration_ms: u64) {
        self.jobs_finished
            .entry(outcome)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let mut durations = self.job_durations.lock().unwrap_or_else(|p| p.into_inner());
        durations.push(duration_ms);
        let len = durations.len();
        if len > KEPT_DURATIONS {
            durations.drain(0..len - KEPT_DURATIONS);
        }
    }

    pub fn set_queue_state(&self, approved: u64, running: u64) {
        self.approved_depth.store(approved, Ordering::Relaxed);
        self.running_jobs.store(running, Ordering::Relaxed);
    }

    pub fn finished(&self, outcome: &str) -> u64 {
        self.jobs_finished
            .get(outcome)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        counter(&mut output, "sandrun_cycles_total", "Total number of dispatcher cycles", self.cycles.load(Ordering::Relaxed));
        counter(&mut output, "sandrun_cycle_faults_total", "Dispatcher cycles aborted by an unexpected error", self.cycle_faults.load(Ordering::Relaxed));
        counter(&mut output, "sandrun_jobs_started_total", "Jobs moved to running", self.jobs_started.load(Ordering::Relaxed));

        output.push_str("# HELP sandrun_approved_jobs Approved jobs waiting for this node\n");
        output.push_str("# TYPE sandrun_approved_jobs gauge\n");
        output.push_str(&format!("sandrun_approved_jobs {}\n\n", self.approved_depth.load(Ordering::Relaxed)));

        output.push_str("# HELP sandrun_running_jobs Jobs currently running for this node\n");
        output.push_str("# TYPE sandrun_running_jobs gauge\n");
        output.push_str(&format!("sandrun_running_jobs {}\n\n", self.running_jobs.load(Ordering::Relaxed)));

        output.push_str("# HELP sandrun_jobs_finished_total Finished job executions by outcome\n");
        output.push_str("# TYPE sandrun_jobs_finished_total counter\n");
        let mut outcomes: Vec<_> = self
            .jobs_finished
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        outcomes.sort_unstable();
        for (outcome, count) in outcomes {
            output.push_str(&format!("sandrun_jobs_finished_total{{outcome=\"{}\"}} {}\n", outcome, count));
        }
        output.push('\n');

        let mut durations = self.job_durations.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if !durations.is_empty() {
            durations.sort_unstable();
            output.push_str("# HELP sandrun_job_duration_ms Job execution duration percentiles\n");
            output.push_str("# TYPE sandrun_job_duration_ms gauge\n");
            for (label, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                output.push_str(&format!(
                    "sandrun_job_duration_ms{{quantile=\"{}\"}} {}\n",
                    label,
                    percentile(&durations, p)
                ));
            }
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    output.push_str(&format!("{} {}\n\n", name, value));
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let data: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&data, 50.0), 51);
        assert_eq!(percentile(&data, 99.0), 99);
        assert_eq!(percentile(&[], 50.0), 0);
    }

    #[test]
    fn test_export_contains_outcomes() {
        let metrics = MetricsCollector::new();
        metrics.increment_cycles();
        metrics.record_started();
        metrics.record_finished(OUTCOME_COMPLETED, 120);
        metrics.record_finished(OUTCOME_TIMEOUT, 5000);

        let text = metrics.export();
        assert!(text.contains("sandrun_cycles_total 1\n"));
        assert!(text.contains("sandrun_jobs_finished_total{outcome=\"completed\"} 1\n"));
        assert!(text.contains("sandrun_jobs_finished_total{outcome=\"timeout\"} 1\n"));
        assert!(text.contains("sandrun_job_duration_ms{quantile=\"0.5\"}"));
        assert_eq!(metrics.finished(OUTCOME_FAILED), 0);
    }

    #[test]
    fn test_duration_window_is_bounded() {
        let metrics = MetricsCollector::new();
        for ms in 0..250 {
            metrics.record_finished(OUTCOME_COMPLETED, ms);
        }
        assert_eq!(metrics.job_durations.lock().unwrap().len(), KEPT_DURATIONS);
        assert_eq!(metrics.finished(OUTCOME_COMPLETED), 250);
    }
}
