use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub tasks: BTreeMap<String, TaskMetrics>,
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct TaskMetrics {
    pub runs: u64,
    pub failures: u64,
    pub last_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared timing counters. Cloning hands out another handle to the same data.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_task(&self, task: &str, duration: Duration, succeeded: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.tasks.entry(task.to_string()).or_default();
            metrics.runs += 1;
            if !succeeded {
                metrics.failures += 1;
            }
            metrics.last_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        task_count = snapshot.tasks.len(),
        "Pipeline metrics summary"
    );
    for (task, metrics) in &snapshot.tasks {
        info!(
            task = task.as_str(),
            runs = metrics.runs,
            failures = metrics.failures,
            last_ms = metrics.last_duration_ms,
            "Task metrics"
        );
    }
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failures_are_counted_separately() {
        let collector = MetricsCollector::new();
        collector.record_task("style", Duration::from_millis(5), true);
        collector.record_task("style", Duration::from_millis(7), false);
        let snapshot = collector.snapshot();
        let style = snapshot.tasks.get("style").unwrap();
        assert_eq!(style.runs, 2);
        assert_eq!(style.failures, 1);
        assert!(style.last_duration_ms >= 7.0);
    }

    #[test]
    fn stage_timer_records_once_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("sass");
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages.get("sass").map(|m| m.calls), Some(1));
    }
}
