//! # Capture Scheduler
//!
//! An in-process scheduler for web page capture jobs. Callers submit
//! [`CaptureItem`]s (URL, artifact name, viewport, time budget); a fixed pool
//! of workers renders them through a [`Renderer`] and persists the image
//! through an [`ArtifactStore`].
//!
//! ## Guarantees
//!
//! - **Backpressure**: the queue is bounded and `submit` rejects with
//!   `QueueFull` instead of blocking
//! - **Bounded concurrency**: at most `worker_count` renders run at once
//! - **Deadlines**: every attempt is abandoned when its time budget elapses,
//!   even if the renderer never returns
//! - **Retries**: render, store and timeout failures are retried up to
//!   `max_attempts`, each attempt with a fresh budget
//! - **Unique names**: at most one active job per artifact name
//! - **Single outcome**: every admitted job reaches exactly one terminal state
//!   and every waiter sees it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_scheduler::{
//!     CaptureItem, CaptureScheduler, ChromiumRenderer, Config, FsArtifactStore, ViewportSize,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let renderer = Arc::new(ChromiumRenderer::launch(&config.renderer).await?);
//!     let store = Arc::new(FsArtifactStore::new("captures", config.renderer.output_format));
//!     let scheduler = CaptureScheduler::new(config.scheduler, renderer, store)?;
//!
//!     let item = CaptureItem::new(
//!         "https://example.com",
//!         "example",
//!         ViewportSize::new(1024, 768),
//!         Duration::from_secs(30),
//!     )?;
//!     let handle = scheduler.submit(item)?;
//!     let outcome = scheduler.wait(&handle).await;
//!     println!("{} finished as {}", outcome.name, outcome.state);
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Single Capture
//! ```bash
//! capture-scheduler capture --url https://example.com --name example
//! ```
//!
//! ### Batch Processing
//! ```bash
//! capture-scheduler --workers 8 --output-dir shots batch --input pages.txt
//! ```

/// Configuration and settings for the scheduler and renderer
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Capture requests and viewport sizes
pub mod item;

/// Job lifecycle, outcomes and handles
pub mod job;

/// Rendering collaborator interface
pub mod renderer;

/// Artifact persistence
pub mod store;

/// Admission, dispatch and outcome publication
pub mod scheduler;

/// Worker tasks executing capture attempts
pub mod worker;

/// Headless Chromium renderer
pub mod chromium;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Health grading for the scheduler
pub mod health;

/// Utility functions and helpers
pub mod utils;


pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use item::*;
pub use job::*;
pub use crate::metrics::{install_prometheus_exporter, Metrics};
pub use renderer::*;
pub use scheduler::{CancelStatus, CaptureScheduler, SchedulerStats};
pub use store::*;
pub use utils::*;
pub use worker::{CaptureWorker, WorkerPool, WorkerStats, RENDER_STOP_GRACE};
