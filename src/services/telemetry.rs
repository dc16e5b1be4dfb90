use std::time::Duration;

/// Best-effort pipeline telemetry. Callers treat every method as
/// infallible; an implementation that cannot record simply doesn't.
pub trait Telemetry: Send + Sync {
    fn job_completed(&self, duration: Duration);
    fn job_failed(&self, reason: &str);
    fn job_retried(&self);
    fn queue_depth(&self, depth: u64);
}

/// Emits through the `metrics` facade. Without an installed recorder the
/// macros are no-ops, so a worker deployed without an exporter loses
/// nothing but the numbers.
pub struct MetricsTelemetry;

impl Telemetry for MetricsTelemetry {
    fn job_completed(&self, duration: Duration) {
        metrics::counter!("prediction_jobs_completed").increment(1);
        metrics::histogram!("prediction_processing_seconds").record(duration.as_secs_f64());
    }

    fn job_failed(&self, reason: &str) {
        metrics::counter!("prediction_jobs_failed", "reason" => reason.to_string()).increment(1);
    }

    fn job_retried(&self) {
        metrics::counter!("prediction_jobs_retried").increment(1);
    }

    fn queue_depth(&self, depth: u64) {
        metrics::gauge!("prediction_queue_depth").set(depth as f64);
    }
}

/// For tests and tools that want the pipeline without any recording.
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn job_completed(&self, _duration: Duration) {}
    fn job_failed(&self, _reason: &str) {}
    fn job_retried(&self) {}
    fn queue_depth(&self, _depth: u64) {}
}
