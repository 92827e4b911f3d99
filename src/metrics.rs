//! Prometheus metrics.
//!
//! The bundle registers lazily on first use against the default registry.
//! If registration fails (duplicate registration in tests, exotic runtime
//! environments) recording degrades to a no-op rather than failing calls.

use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::warn;

struct Metrics {
    tasks_submitted: IntCounterVec,
    tasks_finished: IntCounterVec,
    dispatch_attempts: IntCounterVec,
    breaker_state: IntGaugeVec,
    reserved_bytes: IntGaugeVec,
    task_duration: HistogramVec,
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

fn metrics() -> Option<&'static Metrics> {
    METRICS
        .get_or_init(|| match build() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "metrics registration failed, recording disabled");
                None
            }
        })
        .as_ref()
}

fn build() -> Result<Metrics, prometheus::Error> {
    Ok(Metrics {
        tasks_submitted: register_int_counter_vec!(
            opts!("orchestrator_tasks_submitted_total", "Tasks submitted"),
            &["task_type"]
        )?,
        tasks_finished: register_int_counter_vec!(
            opts!(
                "orchestrator_tasks_finished_total",
                "Tasks reaching a terminal state"
            ),
            &["status"]
        )?,
        dispatch_attempts: register_int_counter_vec!(
            opts!(
                "orchestrator_dispatch_attempts_total",
                "Dispatch attempts per model and runtime"
            ),
            &["model", "runtime", "outcome"]
        )?,
        breaker_state: register_int_gauge_vec!(
            opts!(
                "orchestrator_breaker_state",
                "Breaker state per model and runtime (0 closed, 1 half-open, 2 open)"
            ),
            &["model", "runtime"]
        )?,
        reserved_bytes: register_int_gauge_vec!(
            opts!(
                "orchestrator_runtime_reserved_bytes",
                "Bytes reserved on a runtime"
            ),
            &["runtime"]
        )?,
        task_duration: register_histogram_vec!(
            histogram_opts!(
                "orchestrator_task_duration_seconds",
                "Wall time from submit to terminal state",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["status"]
        )?,
    })
}

/// Record a task submission.
pub fn record_submitted(task_type: &str) {
    if let Some(m) = metrics() {
        m.tasks_submitted.with_label_values(&[task_type]).inc();
    }
}

/// Record a task reaching a terminal state with its total duration.
pub fn record_finished(status: &str, duration_s: f64) {
    if let Some(m) = metrics() {
        m.tasks_finished.with_label_values(&[status]).inc();
        m.task_duration
            .with_label_values(&[status])
            .observe(duration_s);
    }
}

/// Record one dispatch attempt outcome.
pub fn record_dispatch(model: &str, runtime: &str, outcome: &str) {
    if let Some(m) = metrics() {
        m.dispatch_attempts
            .with_label_values(&[model, runtime, outcome])
            .inc();
    }
}

/// Update the breaker state gauge for a (model, runtime) pair.
pub fn set_breaker_state(model: &str, runtime: &str, state: i64) {
    if let Some(m) = metrics() {
        m.breaker_state
            .with_label_values(&[model, runtime])
            .set(state);
    }
}

/// Update the reserved-bytes gauge for a runtime.
pub fn set_reserved_bytes(runtime: &str, bytes: u64) {
    if let Some(m) = metrics() {
        m.reserved_bytes
            .with_label_values(&[runtime])
            .set(bytes as i64);
    }
}
