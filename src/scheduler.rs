//! Capture scheduler: admission, FIFO dispatch and outcome publication
//!
//! All shared mutable state (the queue, the job registry and the index of
//! active names) lives in one [`SchedulerState`] behind one mutex. Every
//! critical section is short, never awaits and never touches the renderer;
//! rendering happens on the worker tasks in [`crate::worker`].

use crate::{
    ArtifactRef, ArtifactStore, CaptureError, CaptureItem, CaptureJob, ErrorSeverity, JobHandle,
    JobId, JobOutcome, JobSnapshot, JobState, Metrics, Renderer, SchedulerConfig, WorkerPool,
    WorkerStats,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Result of [`CaptureScheduler::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The job was still queued; it was removed and is now `Cancelled`
    Dequeued,
    /// The job is running; its worker has been asked to stop
    Signalled,
    /// The job had already reached a terminal state
    AlreadyFinished,
}

#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub is_closed: bool,
    pub workers: Vec<WorkerStats>,
}

impl SchedulerStats {
    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed_count).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.error_count).sum()
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy).count()
    }
}

struct JobEntry {
    job: CaptureJob,
    cancel: CancellationToken,
    outcome_tx: watch::Sender<Option<JobOutcome>>,
}

#[derive(Default)]
struct SchedulerState {
    /// Dispatch order. Ids of jobs cancelled while queued stay behind as
    /// tombstones and are skipped on pop.
    queue: VecDeque<JobId>,
    /// Live (non-tombstone) entries in `queue`
    queued: usize,
    running: usize,
    jobs: HashMap<JobId, JobEntry>,
    active_names: HashMap<String, JobId>,
    next_seq: u64,
    closed: bool,
}

/// Work handed from the queue to a worker
pub(crate) struct Dispatch {
    pub(crate) id: JobId,
    pub(crate) item: Arc<CaptureItem>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) enum NextJob {
    Job(Dispatch),
    Empty,
    Closed,
}

/// What happens after a failed attempt
pub(crate) enum Settled {
    Retry { attempt: u32 },
    Finished(JobOutcome),
    /// The job left the registry before the failure was settled
    Gone,
}

pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) renderer: Arc<dyn Renderer>,
    pub(crate) store: Arc<dyn ArtifactStore>,
    pub(crate) metrics: Metrics,
    pub(crate) notify: Notify,
    state: Mutex<SchedulerState>,
    outcomes: broadcast::Sender<JobOutcome>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, item: CaptureItem) -> Result<JobHandle, CaptureError> {
        item.validate()?;

        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            return Err(CaptureError::ShuttingDown);
        }

        if state.active_names.contains_key(item.name()) {
            return Err(CaptureError::DuplicateName(item.name().to_string()));
        }

        if state.queued >= self.config.queue_capacity {
            return Err(CaptureError::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let job = CaptureJob::new(seq, item);
        let id = job.id;
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = JobHandle::new(&job, outcome_rx);

        state.active_names.insert(job.item.name().to_string(), id);
        state.queue.push_back(id);
        state.queued += 1;
        state.jobs.insert(
            id,
            JobEntry {
                job,
                cancel: CancellationToken::new(),
                outcome_tx,
            },
        );

        self.metrics.set_queue_depth(state.queued);
        self.notify.notify_one();

        debug!(job_id = %id, name = handle.name(), seq, "Job queued");
        Ok(handle)
    }

    /// Pop the head of the queue and move it to `Running`.
    pub(crate) fn take_next(&self) -> NextJob {
        let mut guard = self.lock();
        let state = &mut *guard;

        while let Some(id) = state.queue.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            if entry.job.state != JobState::Queued {
                continue;
            }

            entry.job.start();
            debug!(job_id = %id, seq = entry.job.seq(), "Job dispatched");
            state.queued -= 1;
            state.running += 1;

            let dispatch = Dispatch {
                id,
                item: entry.job.item.clone(),
                cancel: entry.cancel.clone(),
            };

            self.metrics.set_queue_depth(state.queued);
            self.metrics.set_running_jobs(state.running);

            // Hand the baton on so idle workers don't sleep on a non-empty queue.
            if state.queued > 0 {
                self.notify.notify_one();
            }

            return NextJob::Job(dispatch);
        }

        if state.closed {
            NextJob::Closed
        } else {
            NextJob::Empty
        }
    }

    /// Record a failed attempt and decide whether the same worker runs it
    /// again.
    pub(crate) fn settle_failure(&self, id: JobId, error: CaptureError) -> Settled {
        let mut guard = self.lock();

        let Some(entry) = guard.jobs.get_mut(&id) else {
            return Settled::Gone;
        };

        let last_state = match error {
            CaptureError::Timeout(_) => JobState::TimedOut,
            _ => JobState::Failed,
        };
        entry.job.fail_attempt(error.clone());

        if entry.cancel.is_cancelled() {
            return self
                .finish_locked(&mut guard, id, JobState::Cancelled, Err(CaptureError::Cancelled))
                .map_or(Settled::Gone, Settled::Finished);
        }

        if error.is_retryable() && entry.job.attempt + 1 < self.config.max_attempts {
            entry.job.retry();
            self.metrics.record_retry();
            return Settled::Retry {
                attempt: entry.job.attempt,
            };
        }

        self.finish_locked(&mut guard, id, last_state, Err(error))
            .map_or(Settled::Gone, Settled::Finished)
    }

    pub(crate) fn finish(
        &self,
        id: JobId,
        state: JobState,
        result: Result<ArtifactRef, CaptureError>,
    ) -> Option<JobOutcome> {
        let mut guard = self.lock();
        self.finish_locked(&mut guard, id, state, result)
    }

    /// Terminal transition: drop the job from the registry, release its name
    /// and publish the outcome to waiters and subscribers.
    fn finish_locked(
        &self,
        state: &mut SchedulerState,
        id: JobId,
        final_state: JobState,
        result: Result<ArtifactRef, CaptureError>,
    ) -> Option<JobOutcome> {
        let mut entry = state.jobs.remove(&id)?;

        match entry.job.state {
            JobState::Queued => state.queued -= 1,
            _ => state.running -= 1,
        }

        if state.active_names.get(entry.job.item.name()) == Some(&id) {
            state.active_names.remove(entry.job.item.name());
        }

        let outcome = entry.job.finish(final_state, result);

        self.metrics.record_outcome(final_state);
        self.metrics.set_queue_depth(state.queued);
        self.metrics.set_running_jobs(state.running);

        entry.outcome_tx.send_replace(Some(outcome.clone()));
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome.clone());

        Some(outcome)
    }

    fn cancel(&self, id: JobId) -> CancelStatus {
        let mut guard = self.lock();

        let Some(entry) = guard.jobs.get(&id) else {
            return CancelStatus::AlreadyFinished;
        };

        if entry.job.state == JobState::Queued {
            self.finish_locked(&mut guard, id, JobState::Cancelled, Err(CaptureError::Cancelled));
            compact_queue(&mut guard, self.config.queue_capacity);
            CancelStatus::Dequeued
        } else {
            entry.cancel.cancel();
            CancelStatus::Signalled
        }
    }

    /// Stop admitting, cancel everything still queued and signal running
    /// jobs. Safe to call more than once.
    fn close(&self) {
        let mut guard = self.lock();
        if guard.closed {
            return;
        }
        guard.closed = true;

        let queued: Vec<JobId> = guard.queue.drain(..).collect();
        let mut cancelled = 0;
        for id in queued {
            let is_queued = guard
                .jobs
                .get(&id)
                .is_some_and(|entry| entry.job.state == JobState::Queued);
            if is_queued {
                self.finish_locked(&mut guard, id, JobState::Cancelled, Err(CaptureError::Cancelled));
                cancelled += 1;
            }
        }

        for entry in guard.jobs.values() {
            entry.cancel.cancel();
        }
        let running = guard.jobs.len();
        drop(guard);

        self.notify.notify_waiters();
        info!(cancelled, running, "Capture scheduler closed");
    }
}

/// Drop tombstones once they outnumber the capacity, keeping the deque
/// bounded under submit/cancel churn.
fn compact_queue(state: &mut SchedulerState, capacity: usize) {
    if state.queue.len() > capacity.saturating_mul(2) {
        let jobs = &state.jobs;
        state.queue.retain(|id| jobs.contains_key(id));
    }
}

/// In-process scheduler for page-capture jobs
///
/// Owns a bounded FIFO queue and a fixed pool of worker tasks. Must be
/// created inside a tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use capture_scheduler::{
///     CaptureItem, CaptureScheduler, MemoryArtifactStore, SchedulerConfig, ViewportSize,
/// };
/// # use capture_scheduler::Renderer;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run(renderer: Arc<dyn Renderer>) -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryArtifactStore::new());
/// let scheduler = CaptureScheduler::new(SchedulerConfig::default(), renderer, store)?;
///
/// let item = CaptureItem::new(
///     "http://example.test",
///     "ex1",
///     ViewportSize::new(1024, 768),
///     Duration::from_secs(5),
/// )?;
/// let handle = scheduler.submit(item)?;
/// let outcome = scheduler.wait(&handle).await;
/// println!("{} finished as {}", outcome.name, outcome.state);
///
/// scheduler.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CaptureScheduler {
    shared: Arc<Shared>,
    pool: tokio::sync::Mutex<WorkerPool>,
}

impl CaptureScheduler {
    pub fn new(
        config: SchedulerConfig,
        renderer: Arc<dyn Renderer>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self, CaptureError> {
        Self::with_metrics(config, renderer, store, Metrics::new())
    }

    pub fn with_metrics(
        config: SchedulerConfig,
        renderer: Arc<dyn Renderer>,
        store: Arc<dyn ArtifactStore>,
        metrics: Metrics,
    ) -> Result<Self, CaptureError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CaptureError::Config(format!("no tokio runtime: {e}")))?;

        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            config: config.clone(),
            renderer,
            store,
            metrics,
            notify: Notify::new(),
            state: Mutex::new(SchedulerState::default()),
            outcomes,
        });

        let pool = WorkerPool::spawn(&runtime, shared.clone());

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            max_attempts = config.max_attempts,
            "Capture scheduler started"
        );

        Ok(Self {
            shared,
            pool: tokio::sync::Mutex::new(pool),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Admit `item`, or reject it synchronously with `Validation`,
    /// `DuplicateName`, `QueueFull` or `ShuttingDown`. Never waits on
    /// rendering.
    pub fn submit(&self, item: CaptureItem) -> Result<JobHandle, CaptureError> {
        let name = item.name().to_string();
        let result = self.shared.admit(item);
        self.shared.metrics.record_submission(result.is_ok());

        match &result {
            Ok(handle) => info!(job_id = %handle.id(), name = %name, url = handle.url(), "Capture submitted"),
            Err(e) if e.severity() == ErrorSeverity::Low => {
                info!(name = %name, "Capture rejected: {}", e)
            }
            Err(e) => warn!(name = %name, "Capture rejected: {}", e),
        }
        result
    }

    pub fn cancel(&self, handle: &JobHandle) -> CancelStatus {
        let status = self.shared.cancel(handle.id());
        info!(job_id = %handle.id(), name = handle.name(), ?status, "Cancel requested");
        status
    }

    /// Wait for the job's terminal outcome. Any number of callers may wait
    /// on the same handle.
    pub async fn wait(&self, handle: &JobHandle) -> JobOutcome {
        handle.wait().await
    }

    /// Current view of the job, live or finished.
    pub fn status(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        if let Some(entry) = self.shared.lock().jobs.get(&handle.id()) {
            return Some(entry.job.snapshot());
        }

        // Gone from the registry, so the outcome has been published.
        handle
            .try_outcome()
            .map(|outcome| outcome.snapshot(handle.url()))
    }

    /// Receive every terminal outcome from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.shared.outcomes.subscribe()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queued
    }

    pub fn running_len(&self) -> usize {
        self.shared.lock().running
    }

    pub async fn stats(&self) -> SchedulerStats {
        let (queued, running, is_closed) = {
            let state = self.shared.lock();
            (state.queued, state.running, state.closed)
        };

        SchedulerStats {
            worker_count: self.shared.config.worker_count,
            queue_capacity: self.shared.config.queue_capacity,
            queued,
            running,
            is_closed,
            workers: self.pool.lock().await.get_worker_stats(),
        }
    }

    /// Stop admitting jobs, cancel queued ones, signal running ones and wait
    /// for every worker to exit. Each admitted job still gets exactly one
    /// outcome.
    pub async fn shutdown(&self) {
        info!("Shutting down capture scheduler...");
        self.shared.close();
        self.pool.lock().await.join().await;
        info!("Capture scheduler shutdown complete");
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.shared.close();
    }
}
