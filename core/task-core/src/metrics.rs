//! Process-local metrics collector, backed by a private
//! `prometheus::Registry` rather than the crate's global default registry.
//! Each worker/dispatcher process owns its own registry instance, and
//! cross-process aggregation is an external scraping concern.

use std::time::Instant;

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub tasks_success: Counter,
    pub tasks_failure: Counter,
    pub tasks_skipped: Counter,
    pub attempts: Counter,
    pub task_duration: Histogram,
    pub dlq_size: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tasks_success =
            Counter::with_opts(Opts::new("tasks_success", "Tasks completed successfully")).unwrap();
        let tasks_failure =
            Counter::with_opts(Opts::new("tasks_failure", "Tasks that failed at least once")).unwrap();
        let tasks_skipped = Counter::with_opts(Opts::new(
            "tasks_skipped",
            "Duplicate deliveries skipped via the inbox claim",
        ))
        .unwrap();
        let attempts =
            Counter::with_opts(Opts::new("attempts", "Total started execution attempts")).unwrap();
        let task_duration = Histogram::with_opts(HistogramOpts::new(
            "task_duration_seconds",
            "Wall-clock duration of successful handler runs",
        ))
        .unwrap();
        let dlq_size =
            Gauge::with_opts(Opts::new("dlq_size", "Count of dead-letter rows")).unwrap();

        registry.register(Box::new(tasks_success.clone())).unwrap();
        registry.register(Box::new(tasks_failure.clone())).unwrap();
        registry.register(Box::new(tasks_skipped.clone())).unwrap();
        registry.register(Box::new(attempts.clone())).unwrap();
        registry.register(Box::new(task_duration.clone())).unwrap();
        registry.register(Box::new(dlq_size.clone())).unwrap();

        Self {
            registry,
            tasks_success,
            tasks_failure,
            tasks_skipped,
            attempts,
            task_duration,
            dlq_size,
        }
    }

    /// `tasks_success / (tasks_success + tasks_failure)`, or `1.0` when
    /// nothing has run yet.
    pub fn success_rate(&self) -> f64 {
        let success = self.tasks_success.get();
        let failure = self.tasks_failure.get();
        if success + failure == 0.0 {
            1.0
        } else {
            success / (success + failure)
        }
    }

    /// Render in Prometheus text exposition format, for an (out-of-scope)
    /// HTTP layer to mount at `/metrics`.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Measures elapsed wall-clock time for a successful handler run.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_one_with_no_samples() {
        let metrics = Metrics::new();
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn success_rate_reflects_counters() {
        let metrics = Metrics::new();
        metrics.tasks_success.inc();
        metrics.tasks_success.inc();
        metrics.tasks_failure.inc();
        assert!((metrics.success_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.tasks_success.inc();
        let text = metrics.render();
        assert!(text.contains("tasks_success"));
    }
}
