use crate::scheduler::{Dispatch, NextJob, Settled, Shared};
use crate::{
    ArtifactRef, ArtifactStore, CaptureError, CaptureItem, ErrorSeverity, JobOutcome, JobState,
    RenderContext, Renderer,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopped render may keep running to release its resources
/// before its task is aborted.
pub const RENDER_STOP_GRACE: Duration = Duration::from_secs(2);

/// Stand-in budget when `now + time_budget` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// One of the scheduler's fixed worker tasks
///
/// Cloning shares the counters, so the pool keeps a clone for stats while the
/// spawned task owns the other.
#[derive(Clone)]
pub struct CaptureWorker {
    id: usize,
    is_busy: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl CaptureWorker {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            is_busy: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) async fn run(self, shared: Arc<Shared>) {
        info!("Starting capture worker {}", self.id);

        while let Some(dispatch) = next_job(&shared).await {
            self.process(&shared, dispatch).await;
        }

        info!("Capture worker {} stopped", self.id);
    }

    async fn process(&self, shared: &Shared, dispatch: Dispatch) {
        self.is_busy.store(true, Ordering::Relaxed);
        let Dispatch { id, item, cancel } = dispatch;
        let mut attempt = 0;

        let outcome = loop {
            debug!(worker = self.id, job_id = %id, name = item.name(), attempt, "Starting attempt");

            let started = Instant::now();
            let (result, stopped) =
                execute_attempt(&shared.renderer, shared.store.as_ref(), &item, &cancel).await;
            shared.metrics.record_attempt(started.elapsed());

            let settled = match result {
                Ok(artifact) => shared
                    .finish(id, JobState::Succeeded, Ok(artifact))
                    .map_or(Settled::Gone, Settled::Finished),
                Err(CaptureError::Cancelled) => shared
                    .finish(id, JobState::Cancelled, Err(CaptureError::Cancelled))
                    .map_or(Settled::Gone, Settled::Finished),
                Err(e) => {
                    warn!(worker = self.id, job_id = %id, name = item.name(), attempt, "Attempt failed: {}", e);
                    shared.settle_failure(id, e)
                }
            };

            // The outcome is already published; the slot stays taken until
            // the abandoned render has wound down.
            if let Some(stopped) = stopped {
                stopped.reap().await;
            }

            match settled {
                Settled::Retry { attempt: next } => attempt = next,
                Settled::Finished(outcome) => break Some(outcome),
                Settled::Gone => break None,
            }
        };

        if let Some(outcome) = outcome {
            self.record(&outcome);
        }
        self.is_busy.store(false, Ordering::Relaxed);
    }

    fn record(&self, outcome: &JobOutcome) {
        if outcome.is_success() {
            self.processed_count.fetch_add(1, Ordering::Relaxed);
            info!(
                worker = self.id,
                job_id = %outcome.job_id,
                name = %outcome.name,
                attempt = outcome.attempt,
                "Capture succeeded"
            );
            return;
        }

        self.error_count.fetch_add(1, Ordering::Relaxed);
        let severity = outcome
            .error()
            .map_or(ErrorSeverity::Medium, CaptureError::severity);
        match severity {
            ErrorSeverity::Low => info!(
                worker = self.id,
                job_id = %outcome.job_id,
                name = %outcome.name,
                state = %outcome.state,
                "Capture did not complete: {:?}",
                outcome.error()
            ),
            _ => warn!(
                worker = self.id,
                job_id = %outcome.job_id,
                name = %outcome.name,
                attempt = outcome.attempt,
                state = %outcome.state,
                "Capture did not succeed: {:?}",
                outcome.error()
            ),
        }
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_busy: self.is_busy(),
            processed_count: self.processed_count(),
            error_count: self.error_count(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

/// Wait for the next queued job. `None` once the scheduler is closed and the
/// queue is drained.
async fn next_job(shared: &Shared) -> Option<Dispatch> {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        // Register before looking at the queue so a submit in between still
        // wakes us.
        notified.as_mut().enable();

        match shared.take_next() {
            NextJob::Job(dispatch) => return Some(dispatch),
            NextJob::Closed => return None,
            NextJob::Empty => notified.await,
        }
    }
}

/// A render task left running after its attempt timed out or was cancelled
pub(crate) struct StoppedRender {
    task: JoinHandle<anyhow::Result<Vec<u8>>>,
}

impl StoppedRender {
    /// Give the renderer [`RENDER_STOP_GRACE`] to return after its context
    /// fired, then abort it.
    pub(crate) async fn reap(mut self) {
        if tokio::time::timeout(RENDER_STOP_GRACE, &mut self.task)
            .await
            .is_err()
        {
            debug!("Renderer ignored its stop signal, aborting");
            self.task.abort();
        }
    }
}

/// Run one attempt of `item` under its time budget.
///
/// The render runs in its own task so that a panic settles the attempt
/// instead of killing the worker. When the budget elapses or `cancel` fires
/// the attempt ends at once; a render still in progress is handed back as a
/// [`StoppedRender`] with its context already cancelled.
pub(crate) async fn execute_attempt(
    renderer: &Arc<dyn Renderer>,
    store: &dyn ArtifactStore,
    item: &CaptureItem,
    cancel: &CancellationToken,
) -> (Result<ArtifactRef, CaptureError>, Option<StoppedRender>) {
    let budget = item.time_budget();
    let deadline = attempt_deadline(Instant::now(), budget);
    let attempt_token = cancel.child_token();
    let _stop = attempt_token.clone().drop_guard();

    let mut render = tokio::spawn({
        let renderer = Arc::clone(renderer);
        let url = item.url().clone();
        let viewport = item.viewport();
        let ctx = RenderContext::new(deadline, attempt_token.clone());
        async move { renderer.render(&url, viewport, &ctx).await }
    });

    let work = async {
        let bytes = match (&mut render).await {
            Ok(rendered) => rendered.map_err(|e| CaptureError::Render(format!("{e:#}")))?,
            Err(e) if e.is_panic() => {
                return Err(CaptureError::Render(format!(
                    "renderer panicked: {}",
                    panic_message(e.into_panic())
                )))
            }
            Err(e) => return Err(CaptureError::Render(format!("render task failed: {e}"))),
        };

        AssertUnwindSafe(async { store.store(item.name(), &bytes).await })
            .catch_unwind()
            .await
            .map_err(|panic| {
                CaptureError::Store(format!("store panicked: {}", panic_message(panic)))
            })?
            .map_err(|e| CaptureError::Store(format!("{e:#}")))
    };

    let stopped = tokio::select! {
        biased;
        _ = cancel.cancelled() => CaptureError::Cancelled,
        _ = tokio::time::sleep_until(deadline) => CaptureError::Timeout(budget),
        result = work => return (result, None),
    };

    attempt_token.cancel();
    let leftover = (!render.is_finished()).then_some(StoppedRender { task: render });
    (Err(stopped), leftover)
}

/// `now + budget`, or a deadline decades away when that overflows.
fn attempt_deadline(now: Instant, budget: Duration) -> Instant {
    now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |s| (*s).to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_busy: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

pub struct WorkerPool {
    workers: Vec<CaptureWorker>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(runtime: &Handle, shared: Arc<Shared>) -> Self {
        let worker_count = shared.config.worker_count;
        let workers: Vec<CaptureWorker> = (0..worker_count).map(CaptureWorker::new).collect();

        let handles = workers
            .iter()
            .map(|worker| runtime.spawn(worker.clone().run(shared.clone())))
            .collect();

        Self { workers, handles }
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed_count()).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.error_count()).sum()
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// Wait for every worker task to exit. Later calls return immediately.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Capture worker exited abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryArtifactStore, MockArtifactStore, ViewportSize};
    use async_trait::async_trait;
    use url::Url;

    struct SleepRenderer(Duration);

    #[async_trait]
    impl Renderer for SleepRenderer {
        async fn render(
            &self,
            _url: &Url,
            _viewport: ViewportSize,
            _ctx: &RenderContext,
        ) -> anyhow::Result<Vec<u8>> {
            tokio::time::sleep(self.0).await;
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
    }

    struct BrokenRenderer;

    #[async_trait]
    impl Renderer for BrokenRenderer {
        async fn render(
            &self,
            _url: &Url,
            _viewport: ViewportSize,
            _ctx: &RenderContext,
        ) -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("net::ERR_NAME_NOT_RESOLVED"))
        }
    }

    struct PanickingRenderer;

    #[async_trait]
    impl Renderer for PanickingRenderer {
        async fn render(
            &self,
            _url: &Url,
            _viewport: ViewportSize,
            _ctx: &RenderContext,
        ) -> anyhow::Result<Vec<u8>> {
            panic!("tab crashed");
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl ArtifactStore for PanickingStore {
        async fn store(&self, _name: &str, _bytes: &[u8]) -> anyhow::Result<ArtifactRef> {
            panic!("poisoned index");
        }
    }

    /// Waits for its context to fire, then releases its page
    #[derive(Default)]
    struct PageRenderer {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Renderer for PageRenderer {
        async fn render(
            &self,
            _url: &Url,
            _viewport: ViewportSize,
            ctx: &RenderContext,
        ) -> anyhow::Result<Vec<u8>> {
            ctx.stopped().await;
            self.closed.store(true, Ordering::SeqCst);
            Err(anyhow::anyhow!("stopped"))
        }
    }

    fn as_renderer(renderer: impl Renderer + 'static) -> Arc<dyn Renderer> {
        Arc::new(renderer)
    }

    fn item(name: &str, budget: Duration) -> CaptureItem {
        CaptureItem::new("http://example.test", name, ViewportSize::default(), budget)
            .expect("valid item")
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_within_budget_stores_artifact() {
        let store = MemoryArtifactStore::new();
        let renderer = as_renderer(SleepRenderer(Duration::from_secs(1)));

        let (result, stopped) = execute_attempt(
            &renderer,
            &store,
            &item("ex1", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;

        let artifact = result.expect("attempt succeeds");
        assert_eq!(artifact.name, "ex1");
        assert_eq!(artifact.size, 4);
        assert!(store.get("ex1").is_some());
        assert!(stopped.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_times_out_at_budget() {
        let store = MemoryArtifactStore::new();
        let renderer = as_renderer(SleepRenderer(Duration::from_secs(10)));
        let started = Instant::now();

        let (result, stopped) = execute_attempt(
            &renderer,
            &store,
            &item("slow", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result, Err(CaptureError::Timeout(Duration::from_secs(5))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
        assert!(store.is_empty());

        // The renderer ignores its context, so it is aborted after the grace period.
        stopped.expect("render still running").reap().await;
        assert!(started.elapsed() < Duration::from_secs(8));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_observes_cancellation() {
        let store = MemoryArtifactStore::new();
        let renderer = as_renderer(SleepRenderer(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let (result, _stopped) =
            execute_attempt(&renderer, &store, &item("c", Duration::from_secs(60)), &cancel).await;
        assert_eq!(result, Err(CaptureError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_renderer_releases_its_page() {
        let store = MemoryArtifactStore::new();
        let page = Arc::new(PageRenderer::default());
        let renderer: Arc<dyn Renderer> = page.clone();

        let (result, stopped) = execute_attempt(
            &renderer,
            &store,
            &item("tab", Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result, Err(CaptureError::Timeout(Duration::from_secs(1))));

        if let Some(stopped) = stopped {
            let started = Instant::now();
            stopped.reap().await;
            assert!(started.elapsed() < RENDER_STOP_GRACE);
        }
        assert!(page.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_renderer_releases_its_page() {
        let store = MemoryArtifactStore::new();
        let page = Arc::new(PageRenderer::default());
        let renderer: Arc<dyn Renderer> = page.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, stopped) =
            execute_attempt(&renderer, &store, &item("tab", Duration::from_secs(60)), &cancel)
                .await;
        assert_eq!(result, Err(CaptureError::Cancelled));

        if let Some(stopped) = stopped {
            stopped.reap().await;
        }
        assert!(page.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_budget_does_not_expire() {
        let store = MemoryArtifactStore::new();
        let renderer = as_renderer(SleepRenderer(Duration::from_secs(1)));

        let (result, _stopped) = execute_attempt(
            &renderer,
            &store,
            &item("big", Duration::MAX),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.map(|a| a.name), Ok("big".to_string()));
    }

    #[test]
    fn test_attempt_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(
            attempt_deadline(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        assert_eq!(attempt_deadline(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[tokio::test]
    async fn test_render_failure_is_retryable() {
        let store = MemoryArtifactStore::new();
        let (result, _stopped) = execute_attempt(
            &as_renderer(BrokenRenderer),
            &store,
            &item("broken", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(e @ CaptureError::Render(_)) => {
                assert!(e.is_retryable());
                assert!(e.to_string().contains("ERR_NAME_NOT_RESOLVED"));
            }
            other => panic!("expected render error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renderer_panic_becomes_render_error() {
        let store = MemoryArtifactStore::new();
        let (result, stopped) = execute_attempt(
            &as_renderer(PanickingRenderer),
            &store,
            &item("crash", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(CaptureError::Render(message)) => {
                assert!(message.contains("renderer panicked: tab crashed"), "{message}");
            }
            other => panic!("expected render error, got {other:?}"),
        }
        assert!(stopped.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_panic_becomes_store_error() {
        let (result, _stopped) = execute_attempt(
            &as_renderer(SleepRenderer(Duration::ZERO)),
            &PanickingStore,
            &item("full", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(
            result,
            Err(CaptureError::Store("store panicked: poisoned index".to_string()))
        );
    }

    #[tokio::test]
    async fn test_store_failure_maps_to_store_error() {
        let mut store = MockArtifactStore::new();
        store
            .expect_store()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("disk full")));

        let (result, _stopped) = execute_attempt(
            &as_renderer(SleepRenderer(Duration::ZERO)),
            &store,
            &item("full", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result, Err(CaptureError::Store("disk full".to_string())));
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
