use crate::{CaptureError, JobState};
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Scheduler instrumentation
///
/// Handles are registered against whatever recorder is installed when the
/// scheduler is built; without one they are no-ops.
#[derive(Clone)]
pub struct Metrics {
    pub jobs_submitted: Counter,
    pub jobs_rejected: Counter,
    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub jobs_timed_out: Counter,
    pub jobs_cancelled: Counter,
    pub retry_count: Counter,
    pub queue_depth: Gauge,
    pub running_jobs: Gauge,
    pub attempt_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: register_counter!("capture_jobs_submitted_total"),
            jobs_rejected: register_counter!("capture_jobs_rejected_total"),
            jobs_succeeded: register_counter!("capture_jobs_succeeded_total"),
            jobs_failed: register_counter!("capture_jobs_failed_total"),
            jobs_timed_out: register_counter!("capture_jobs_timed_out_total"),
            jobs_cancelled: register_counter!("capture_jobs_cancelled_total"),
            retry_count: register_counter!("capture_retries_total"),
            queue_depth: register_gauge!("capture_queue_depth"),
            running_jobs: register_gauge!("capture_running_jobs"),
            attempt_duration: register_histogram!("capture_attempt_duration_seconds"),
        }
    }

    pub fn noop() -> Self {
        Self {
            jobs_submitted: Counter::noop(),
            jobs_rejected: Counter::noop(),
            jobs_succeeded: Counter::noop(),
            jobs_failed: Counter::noop(),
            jobs_timed_out: Counter::noop(),
            jobs_cancelled: Counter::noop(),
            retry_count: Counter::noop(),
            queue_depth: Gauge::noop(),
            running_jobs: Gauge::noop(),
            attempt_duration: Histogram::noop(),
        }
    }

    pub fn record_submission(&self, accepted: bool) {
        if accepted {
            self.jobs_submitted.increment(1);
        } else {
            self.jobs_rejected.increment(1);
        }
    }

    pub fn record_outcome(&self, state: JobState) {
        match state {
            JobState::Succeeded => self.jobs_succeeded.increment(1),
            JobState::Failed => self.jobs_failed.increment(1),
            JobState::TimedOut => self.jobs_timed_out.increment(1),
            JobState::Cancelled => self.jobs_cancelled.increment(1),
            JobState::Queued | JobState::Running => {}
        }
    }

    pub fn record_attempt(&self, duration: Duration) {
        self.attempt_duration.record(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.retry_count.increment(1);
    }

    pub fn set_queue_depth(&self, size: usize) {
        self.queue_depth.set(size as f64);
    }

    pub fn set_running_jobs(&self, count: usize) {
        self.running_jobs.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder and serve `/metrics` on `port`.
///
/// Must run inside a tokio runtime and before the scheduler is constructed,
/// otherwise the scheduler's handles stay no-ops.
pub fn install_prometheus_exporter(port: u16) -> Result<(), CaptureError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CaptureError::Config(format!("metrics exporter: {e}")))?;

    info!("Serving Prometheus metrics on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_metrics_accept_records() {
        let metrics = Metrics::noop();
        metrics.record_submission(true);
        metrics.record_submission(false);
        metrics.record_outcome(JobState::TimedOut);
        metrics.record_attempt(Duration::from_millis(250));
        metrics.set_queue_depth(3);
        metrics.set_running_jobs(1);
    }
}
