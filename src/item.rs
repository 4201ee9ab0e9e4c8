//! Capture requests as submitted by callers
//!
//! A [`CaptureItem`] is validated once at construction and is immutable
//! afterwards; the scheduler only ever reads it.

use crate::{validate_url, CaptureError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Browser viewport used to render a page, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

impl ViewportSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ViewportSize {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

impl fmt::Display for ViewportSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One page-capture request
///
/// # Examples
///
/// ```rust
/// use capture_scheduler::{CaptureItem, ViewportSize};
/// use std::time::Duration;
///
/// let item = CaptureItem::new(
///     "http://example.test",
///     "ex1",
///     ViewportSize::new(1024, 768),
///     Duration::from_secs(5),
/// )
/// .expect("valid item");
/// assert_eq!(item.name(), "ex1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureItem {
    url: Url,
    name: String,
    viewport: ViewportSize,
    time_budget: Duration,
}

impl CaptureItem {
    pub fn new(
        url: &str,
        name: impl Into<String>,
        viewport: ViewportSize,
        time_budget: Duration,
    ) -> Result<Self, CaptureError> {
        let url = validate_url(url)
            .map_err(|e| CaptureError::Validation(format!("invalid url '{url}': {e}")))?;
        Self::from_parts(url, name.into(), viewport, time_budget)
    }

    /// Build an item from an already parsed URL. The URL still has to be
    /// http or https.
    pub fn from_url(
        url: Url,
        name: impl Into<String>,
        viewport: ViewportSize,
        time_budget: Duration,
    ) -> Result<Self, CaptureError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CaptureError::Validation(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        Self::from_parts(url, name.into(), viewport, time_budget)
    }

    fn from_parts(
        url: Url,
        name: String,
        viewport: ViewportSize,
        time_budget: Duration,
    ) -> Result<Self, CaptureError> {
        let item = Self {
            url,
            name,
            viewport,
            time_budget,
        };
        item.validate()?;
        Ok(item)
    }

    /// Re-check the invariants established at construction.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.name.trim().is_empty() {
            return Err(CaptureError::Validation("name must not be empty".to_string()));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(CaptureError::Validation(format!(
                "viewport dimensions must be positive, got {}",
                self.viewport
            )));
        }

        if self.time_budget.is_zero() {
            return Err(CaptureError::Validation(
                "time budget must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn viewport(&self) -> ViewportSize {
        self.viewport
    }

    pub fn time_budget(&self) -> Duration {
        self.time_budget
    }
}
