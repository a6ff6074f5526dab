use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::crawler::stats::TaskStats;

/// Name of the browser duration histogram
pub const BROWSER_DURATION_METRIC: &str = "browser_duration_seconds";

/// Bucket layout of the browser duration histogram: 0, 2, ..., 88 seconds
pub const BUCKET_START: f64 = 0.0;
pub const BUCKET_WIDTH: f64 = 2.0;
pub const BUCKET_COUNT: usize = 45;

/// Cumulative histogram with fixed upper bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// Observations per bucket, not cumulative; the last slot is +Inf
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn linear(start: f64, width: f64, count: usize) -> Self {
        let bounds: Vec<f64> = (0..count).map(|i| start + width * i as f64).collect();
        Self {
            counts: vec![0; bounds.len() + 1],
            bounds,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        let slot = self.bounds.iter().position(|b| value <= *b).unwrap_or(self.bounds.len());
        self.counts[slot] += 1;
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// `(upper bound, cumulative count)` pairs, excluding +Inf
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.bounds.iter()
            .zip(&self.counts)
            .map(|(bound, count)| {
                running += count;
                (*bound, running)
            })
            .collect()
    }
}

/// Aggregated monitoring data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub start_time: DateTime<Utc>,
    pub tasks_total: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// Seconds from the start of the crawl to the end of storage
    pub browser_duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            tasks_total: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            browser_duration: Histogram::linear(BUCKET_START, BUCKET_WIDTH, BUCKET_COUNT),
        }
    }
}

/// Task metrics collector, shared between the sink and the HTTP endpoint
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one attempt's stats into the aggregates
    pub async fn record(&self, stats: &TaskStats) {
        let mut metrics = self.metrics.lock().await;

        metrics.tasks_total += 1;
        if stats.task_succeeded {
            metrics.tasks_succeeded += 1;
        } else {
            metrics.tasks_failed += 1;
        }

        if let Some(seconds) = stats.total_duration_secs() {
            metrics.browser_duration.observe(seconds);
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Render the metrics in the Prometheus text exposition format
    pub async fn render(&self) -> String {
        let metrics = self.get_metrics().await;
        let mut out = String::new();

        counter(&mut out, "crawler_tasks_total", "Task attempts that reached storage", metrics.tasks_total);
        counter(&mut out, "crawler_tasks_succeeded_total", "Task attempts that succeeded", metrics.tasks_succeeded);
        counter(&mut out, "crawler_tasks_failed_total", "Task attempts that failed", metrics.tasks_failed);

        let histogram = &metrics.browser_duration;
        let _ = writeln!(out, "# HELP {} A histogram of browser open durations", BROWSER_DURATION_METRIC);
        let _ = writeln!(out, "# TYPE {} histogram", BROWSER_DURATION_METRIC);
        for (bound, count) in histogram.cumulative() {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", BROWSER_DURATION_METRIC, bound, count);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", BROWSER_DURATION_METRIC, histogram.count());
        let _ = writeln!(out, "{}_sum {}", BROWSER_DURATION_METRIC, histogram.sum());
        let _ = writeln!(out, "{}_count {}", BROWSER_DURATION_METRIC, histogram.count());

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stats(succeeded: bool, seconds: i64) -> TaskStats {
        let begin = Utc::now();
        let mut stats = TaskStats {
            task_succeeded: succeeded,
            ..TaskStats::default()
        };
        stats.timing.begin_crawl = Some(begin);
        stats.timing.end_storage = Some(begin + Duration::seconds(seconds));
        stats
    }

    #[test]
    fn test_linear_buckets() {
        let histogram = Histogram::linear(BUCKET_START, BUCKET_WIDTH, BUCKET_COUNT);
        let bounds: Vec<f64> = histogram.cumulative().into_iter().map(|(b, _)| b).collect();
        assert_eq!(bounds.len(), 45);
        assert_eq!(bounds[0], 0.0);
        assert_eq!(bounds[1], 2.0);
        assert_eq!(bounds[44], 88.0);
    }

    #[test]
    fn test_observations_are_cumulative() {
        let mut histogram = Histogram::linear(0.0, 2.0, 3);
        histogram.observe(1.0);
        histogram.observe(2.0);
        histogram.observe(3.5);
        histogram.observe(100.0);

        assert_eq!(histogram.cumulative(), vec![(0.0, 0), (2.0, 2), (4.0, 3)]);
        assert_eq!(histogram.count(), 4);
        assert_eq!(histogram.sum(), 106.5);
    }

    #[tokio::test]
    async fn test_collector_counts_outcomes() {
        let collector = MetricsCollector::new();
        collector.record(&stats(true, 5)).await;
        collector.record(&stats(false, 12)).await;
        collector.record(&TaskStats::default()).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.tasks_total, 3);
        assert_eq!(metrics.tasks_succeeded, 1);
        assert_eq!(metrics.tasks_failed, 2);
        // Stats without timing are counted but not observed
        assert_eq!(metrics.browser_duration.count(), 2);
    }

    #[tokio::test]
    async fn test_prometheus_rendering() {
        let collector = MetricsCollector::new();
        collector.record(&stats(true, 3)).await;

        let text = collector.render().await;
        assert!(text.contains("crawler_tasks_total 1\n"));
        assert!(text.contains("# TYPE browser_duration_seconds histogram\n"));
        assert!(text.contains("browser_duration_seconds_bucket{le=\"2\"} 0\n"));
        assert!(text.contains("browser_duration_seconds_bucket{le=\"4\"} 1\n"));
        assert!(text.contains("browser_duration_seconds_bucket{le=\"+Inf\"} 1\n"));
        assert!(text.contains("browser_duration_seconds_count 1\n"));
    }
}
