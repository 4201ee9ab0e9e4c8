//! Rendering collaborator interface
//!
//! A [`Renderer`] loads a page at a viewport size and returns encoded image
//! bytes. The scheduler ends an attempt as soon as its deadline passes or it
//! is cancelled, whether or not the renderer has returned. The renderer's
//! [`RenderContext`] fires at the same moment; a renderer that returns within
//! [`crate::RENDER_STOP_GRACE`] of that gets to release its browser
//! resources, one that doesn't is aborted.

use crate::ViewportSize;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Per-attempt limits handed to the renderer
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// The attempt is abandoned at this instant
    pub deadline: Instant,
    /// Fired on explicit cancellation and when the deadline elapses
    pub cancel: CancellationToken,
}

impl RenderContext {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt should stop, whichever of cancellation or
    /// the deadline comes first.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `url` at `viewport` and return the encoded screenshot.
    async fn render(
        &self,
        url: &Url,
        viewport: ViewportSize,
        ctx: &RenderContext,
    ) -> anyhow::Result<Vec<u8>>;
}
