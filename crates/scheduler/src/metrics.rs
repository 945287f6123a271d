use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Driver-side counters, one entry per task name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    /// Number of `run()` calls by task name.
    pub tasks_executed: HashMap<String, u64>,
    /// Average duration of one `run()` by task name.
    pub avg_run_duration: HashMap<String, Duration>,
    /// Last time each task finished a run.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Runs that returned `false` or an error.
    pub failures: u64,
}

impl PipelineMetrics {
    /// Record one task run.
    pub fn record_execution(&mut self, task_name: &str, duration: Duration) {
        *self.tasks_executed.entry(task_name.to_string()).or_default() += 1;
        self.last_run.insert(task_name.to_string(), Utc::now());

        let count = self.tasks_executed[task_name];
        let prev_avg = self
            .avg_run_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_run_duration.insert(task_name.to_string(), new_avg);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn runs(&self, task_name: &str) -> u64 {
        self.tasks_executed.get(task_name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = PipelineMetrics::default();
        m.record_execution("sieving", Duration::from_millis(100));
        assert_eq!(m.runs("sieving"), 1);
        assert_eq!(m.avg_run_duration["sieving"], Duration::from_millis(100));
        assert!(m.last_run.contains_key("sieving"));
    }

    #[test]
    fn rolling_average() {
        let mut m = PipelineMetrics::default();
        m.record_execution("filter", Duration::from_millis(100));
        m.record_execution("filter", Duration::from_millis(200));
        m.record_execution("filter", Duration::from_millis(300));
        assert_eq!(m.runs("filter"), 3);
        let avg = m.avg_run_duration["filter"].as_millis();
        assert!((199..=201).contains(&avg), "avg = {avg}");
        assert_eq!(m.runs("other"), 0);
    }
}
