//! Job lifecycle bookkeeping
//!
//! A [`CaptureJob`] wraps one admitted [`CaptureItem`] and tracks it through
//! the state machine below. Jobs are owned by the scheduler; callers only see
//! [`JobHandle`]s, [`JobSnapshot`]s and the final [`JobOutcome`].
//!
//! ```text
//! Queued  -> Running | Cancelled
//! Running -> Succeeded | Failed | TimedOut | Cancelled
//! Failed  -> Running (retry) | Cancelled
//! TimedOut-> Running (retry) | Cancelled
//! ```

use crate::{ArtifactRef, CaptureError, CaptureItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Identity of one admitted job. Names can be reused once a job is finished,
/// ids never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Failed, Running)
                | (Failed, Cancelled)
                | (TimedOut, Running)
                | (TimedOut, Cancelled)
        )
    }

    /// States a job may end in. `Failed` and `TimedOut` are only final once
    /// no further attempt follows.
    pub(crate) fn can_be_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Scheduler-side record of one admitted item
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub(crate) id: JobId,
    pub(crate) seq: u64,
    pub(crate) item: Arc<CaptureItem>,
    pub(crate) state: JobState,
    pub(crate) attempt: u32,
    pub(crate) admitted_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<CaptureError>,
}

impl CaptureJob {
    pub(crate) fn new(seq: u64, item: CaptureItem) -> Self {
        Self {
            id: JobId::new(),
            seq,
            item: Arc::new(item),
            state: JobState::Queued,
            attempt: 0,
            admitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.finished_at.is_none() && self.state.can_transition_to(next),
            "illegal job transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    /// `Queued -> Running` for the first attempt.
    pub(crate) fn start(&mut self) {
        self.transition(JobState::Running);
        self.started_at = Some(Utc::now());
    }

    /// `Failed | TimedOut -> Running`, counting a new attempt.
    pub(crate) fn retry(&mut self) {
        self.transition(JobState::Running);
        self.attempt += 1;
        self.started_at = Some(Utc::now());
    }

    /// Record a failed attempt, moving to `Failed` or `TimedOut`.
    pub(crate) fn fail_attempt(&mut self, error: CaptureError) {
        let next = match error {
            CaptureError::Timeout(_) => JobState::TimedOut,
            _ => JobState::Failed,
        };
        self.transition(next);
        self.last_error = Some(error);
    }

    /// Enter the terminal state and build the outcome every waiter receives.
    pub(crate) fn finish(
        &mut self,
        state: JobState,
        result: Result<ArtifactRef, CaptureError>,
    ) -> JobOutcome {
        if self.state != state {
            self.transition(state);
        }
        debug_assert!(state.can_be_terminal());

        let finished_at = Utc::now();
        self.finished_at = Some(finished_at);
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }

        JobOutcome {
            job_id: self.id,
            name: self.item.name().to_string(),
            state,
            attempt: self.attempt,
            result,
            admitted_at: self.admitted_at,
            started_at: self.started_at,
            finished_at,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Admission order; dispatch is FIFO by this number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn item(&self) -> &CaptureItem {
        &self.item
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            name: self.item.name().to_string(),
            url: self.item.url().to_string(),
            state: self.state,
            attempt: self.attempt,
            admitted_at: self.admitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Final result of a job, delivered once to every waiter and subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub name: String,
    pub state: JobState,
    /// Zero-based index of the last attempt that ran
    pub attempt: u32,
    pub result: Result<ArtifactRef, CaptureError>,
    pub admitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CaptureError> {
        self.result.as_ref().err()
    }

    pub fn snapshot(&self, url: &str) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id,
            name: self.name.clone(),
            url: url.to_string(),
            state: self.state,
            attempt: self.attempt,
            admitted_at: self.admitted_at,
            started_at: self.started_at,
            finished_at: Some(self.finished_at),
            last_error: self.error().map(|e| e.to_string()),
        }
    }
}

/// Point-in-time view of a job, for polling and reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub name: String,
    pub url: String,
    pub state: JobState,
    pub attempt: u32,
    pub admitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Caller's reference to a submitted job
///
/// Handles are cheap to clone; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    seq: u64,
    name: String,
    url: String,
    admitted_at: DateTime<Utc>,
    outcome: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    pub(crate) fn new(job: &CaptureJob, outcome: watch::Receiver<Option<JobOutcome>>) -> Self {
        Self {
            id: job.id,
            seq: job.seq,
            name: job.item.name().to_string(),
            url: job.item.url().to_string(),
            admitted_at: job.admitted_at,
            outcome,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Admission order; lower numbers are dispatched first.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The outcome, if the job has already finished.
    pub fn try_outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Suspend until the job is terminal.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.outcome.clone();
        let published = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        // The sender is only dropped after publishing, so a closed channel
        // without a value means the scheduler was torn down mid-flight.
        published.unwrap_or_else(|| JobOutcome {
            job_id: self.id,
            name: self.name.clone(),
            state: JobState::Cancelled,
            attempt: 0,
            result: Err(CaptureError::Cancelled),
            admitted_at: self.admitted_at,
            started_at: None,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ViewportSize;
    use std::time::Duration;

    fn job() -> CaptureJob {
        let item = CaptureItem::new(
            "http://example.test",
            "ex1",
            ViewportSize::new(1024, 768),
            Duration::from_secs(5),
        )
        .expect("valid item");
        CaptureJob::new(0, item)
    }

    #[test]
    fn test_transition_table() {
        use JobState::*;

        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(TimedOut));
        assert!(Failed.can_transition_to(Running));
        assert!(TimedOut.can_transition_to(Running));

        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn test_retry_increments_attempt() {
        let mut job = job();
        assert_eq!(job.state(), JobState::Queued);
        assert!(job.started_at.is_none());

        job.start();
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.attempt(), 0);
        assert!(job.started_at.is_some());

        job.fail_attempt(CaptureError::Timeout(Duration::from_secs(5)));
        assert_eq!(job.state(), JobState::TimedOut);

        job.retry();
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.attempt(), 1);
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_finish_sets_finished_at() {
        let mut job = job();
        job.start();
        job.fail_attempt(CaptureError::Render("502".to_string()));

        let error = CaptureError::Render("502".to_string());
        let outcome = job.finish(JobState::Failed, Err(error.clone()));

        assert!(job.is_terminal());
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.error(), Some(&error));
        assert!(outcome.finished_at >= outcome.admitted_at);
        assert_eq!(job.snapshot().finished_at, Some(outcome.finished_at));
    }

    #[test]
    fn test_snapshot_serializes() {
        let job = job();
        let json = serde_json::to_value(job.snapshot()).expect("serializes");
        assert_eq!(json["state"], "queued");
        assert_eq!(json["name"], "ex1");
        assert_eq!(json["url"], "http://example.test/");
        assert!(json["finished_at"].is_null());
    }

    #[tokio::test]
    async fn test_handle_wait_sees_published_outcome() {
        let mut job = job();
        let (tx, rx) = watch::channel(None);
        let handle = JobHandle::new(&job, rx);
        assert!(handle.try_outcome().is_none());

        let outcome = job.finish(JobState::Cancelled, Err(CaptureError::Cancelled));
        tx.send_replace(Some(outcome.clone()));

        assert_eq!(handle.wait().await, outcome);
        assert_eq!(handle.clone().try_outcome(), Some(outcome));
    }

    #[tokio::test]
    async fn test_handle_wait_on_dropped_sender() {
        let job = job();
        let (tx, rx) = watch::channel(None);
        let handle = JobHandle::new(&job, rx);
        drop(tx);

        let outcome = handle.wait().await;
        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.job_id, job.id());
    }
}
