use crate::{CaptureScheduler, SchedulerStats};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Queue fill ratio that counts as a warning
    pub queue_warning: f64,
    /// Queue fill ratio that counts as critical
    pub queue_critical: f64,
    /// Share of busy workers that counts as a warning
    pub max_worker_utilization: f64,
    pub max_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_warning: 0.75,
            queue_critical: 0.95,
            max_worker_utilization: 0.9,
            max_error_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub queue: HealthLevel,
    pub workers: HealthLevel,
    pub errors: HealthLevel,
    pub timestamp: SystemTime,
}

pub struct HealthChecker {
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn assess(&self, stats: &SchedulerStats) -> HealthStatus {
        let queue = self.check_queue(stats);
        let workers = self.check_workers(stats);
        let errors = self.check_error_rate(stats);

        HealthStatus {
            overall: determine_overall_health(&[queue, workers, errors]),
            queue,
            workers,
            errors,
            timestamp: SystemTime::now(),
        }
    }

    pub async fn check(&self, scheduler: &CaptureScheduler) -> HealthStatus {
        self.assess(&scheduler.stats().await)
    }

    fn check_queue(&self, stats: &SchedulerStats) -> HealthLevel {
        if stats.is_closed {
            return HealthLevel::Critical;
        }

        let fill = ratio(stats.queued, stats.queue_capacity);
        if fill >= self.thresholds.queue_critical {
            HealthLevel::Critical
        } else if fill >= self.thresholds.queue_warning {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn check_workers(&self, stats: &SchedulerStats) -> HealthLevel {
        // A saturated pool with work still waiting means captures are delayed.
        let utilization = ratio(stats.running, stats.worker_count);
        if utilization > self.thresholds.max_worker_utilization && stats.queued > 0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn check_error_rate(&self, stats: &SchedulerStats) -> HealthLevel {
        let errors = stats.total_errors();
        let error_rate = ratio(errors, errors + stats.total_processed());

        if error_rate > self.thresholds.max_error_rate * 2.0 {
            HealthLevel::Critical
        } else if error_rate > self.thresholds.max_error_rate {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn determine_overall_health(levels: &[HealthLevel]) -> HealthLevel {
    levels.iter().copied().max().unwrap_or(HealthLevel::Healthy)
}

/// Log the scheduler's health every `period` until it closes.
pub async fn monitor_health(scheduler: Arc<CaptureScheduler>, period: Duration) {
    let checker = HealthChecker::default();
    let mut timer = interval(period);

    loop {
        timer.tick().await;
        let stats = scheduler.stats().await;
        if stats.is_closed {
            break;
        }

        let status = checker.assess(&stats);
        match status.overall {
            HealthLevel::Healthy => info!(
                queued = stats.queued,
                running = stats.running,
                "Scheduler health: OK"
            ),
            HealthLevel::Warning => warn!(
                "Scheduler health: WARNING - queue: {:?}, workers: {:?}, errors: {:?}",
                status.queue, status.workers, status.errors
            ),
            HealthLevel::Critical => error!(
                "Scheduler health: CRITICAL - queue: {:?}, workers: {:?}, errors: {:?}",
                status.queue, status.workers, status.errors
            ),
        }
    }
}
