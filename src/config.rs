//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the capture scheduler
//! and its bundled collaborators: worker pool sizing, queue backpressure, retry
//! ceiling, and the settings of the headless Chromium renderer.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the capture runner
///
/// Combines the scheduler settings with the renderer and artifact store
/// settings used by the command-line runner. Usually loaded from a JSON file
/// and then overridden by command-line flags.
///
/// # Examples
///
/// ```rust
/// use capture_scheduler::{Config, SchedulerConfig};
///
/// let config = Config {
///     scheduler: SchedulerConfig {
///         worker_count: 4,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool, queue and retry settings
    pub scheduler: SchedulerConfig,

    /// Headless browser settings
    pub renderer: RendererConfig,

    /// Directory that receives stored artifacts (default: `./captures`)
    pub output_dir: OutputDir,
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        self.scheduler.validate()
    }
}

/// Artifact directory, defaulting to `./captures`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct OutputDir(pub PathBuf);

impl Default for OutputDir {
    fn default() -> Self {
        Self(PathBuf::from("captures"))
    }
}

/// Construction-time settings of the capture scheduler
///
/// # Examples
///
/// ```rust
/// use capture_scheduler::SchedulerConfig;
///
/// let config = SchedulerConfig {
///     worker_count: 2,
///     queue_capacity: 16,
///     max_attempts: 1,
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker slots, i.e. the maximum number of jobs running at
    /// once (default: number of CPUs)
    pub worker_count: usize,

    /// Maximum number of jobs waiting in the queue (default: 256)
    ///
    /// Submissions beyond this are rejected with `QueueFull` instead of
    /// buffering without bound. Running jobs do not count against it.
    pub queue_capacity: usize,

    /// Total attempts per job, first run included (default: 3)
    ///
    /// Render failures, store failures and timeouts are retried until this
    /// ceiling is reached. Cancellation is never retried.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_capacity: 256,
            max_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.worker_count == 0 {
            return Err(CaptureError::Config(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(CaptureError::Config(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(CaptureError::Config(
                "Max attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Headless Chromium settings used by [`crate::ChromiumRenderer`]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string (default: Chrome default)
    pub user_agent: Option<String>,

    /// Encoding of the stored artifacts (default: PNG)
    pub output_format: OutputFormat,

    /// Enable JavaScript execution (default: true)
    pub enable_javascript: bool,

    /// Skip image loading for faster, text-only captures (default: false)
    pub block_images: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            user_agent: None,
            output_format: OutputFormat::Png,
            enable_javascript: true,
            block_images: false,
        }
    }
}

/// Supported output image formats for captures
///
/// - PNG: lossless, what the browser produces natively
/// - JPEG: lossy, smaller files
/// - WebP: modern compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(CaptureError::Config(format!(
                "Unknown output format '{other}'"
            ))),
        }
    }
}

/// Generate Chrome command-line arguments for a renderer instance
///
/// Each launch gets its own user data and temp directories so several
/// renderers in one process never trip over Chrome's singleton lock.
pub fn get_chrome_args(config: &RendererConfig, instance_id: &str) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!("--user-data-dir=/tmp/capture-scheduler-{instance_id}"),
        format!("--temp-dir=/tmp/capture-scheduler-temp-{instance_id}"),
    ];

    if config.block_images {
        args.push("--blink-settings=imagesEnabled=false".to_string());
    }

    if !config.enable_javascript {
        args.push("--disable-javascript".to_string());
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &RendererConfig,
    instance_id: &str,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder().args(get_chrome_args(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::Config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert!(config.worker_count >= 1);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_rejects_zeroes() {
        let base = SchedulerConfig {
            worker_count: 1,
            queue_capacity: 1,
            max_attempts: 1,
        };

        for bad in [
            SchedulerConfig { worker_count: 0, ..base.clone() },
            SchedulerConfig { queue_capacity: 0, ..base.clone() },
            SchedulerConfig { max_attempts: 0, ..base.clone() },
        ] {
            assert!(matches!(bad.validate(), Err(CaptureError::Config(_))));
        }
    }

    #[test]
    fn test_config_from_partial_json() {
        let json = r#"{ "scheduler": { "worker_count": 2 }, "output_dir": "/tmp/out" }"#;
        let config: Config = serde_json::from_str(json).expect("config parses");

        assert_eq!(config.scheduler.worker_count, 2);
        assert_eq!(config.scheduler.queue_capacity, 256);
        assert_eq!(config.output_dir.0, PathBuf::from("/tmp/out"));
        assert_eq!(config.renderer.output_format, OutputFormat::Png);
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("PNG".parse::<OutputFormat>().ok(), Some(OutputFormat::Png));
        assert_eq!("jpg".parse::<OutputFormat>().ok(), Some(OutputFormat::Jpeg));
        assert_eq!("webp".parse::<OutputFormat>().ok(), Some(OutputFormat::Webp));
        assert!("gif".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
    }

    #[test]
    fn test_chrome_args_generation() {
        let config = RendererConfig {
            user_agent: Some("capture-bot".to_string()),
            block_images: true,
            ..Default::default()
        };
        let args = get_chrome_args(&config, "test-1");

        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/capture-scheduler-test-1".to_string()));
        assert!(args.contains(&"--user-agent=capture-bot".to_string()));
        assert!(args.contains(&"--blink-settings=imagesEnabled=false".to_string()));
        assert!(!args.contains(&"--disable-javascript".to_string()));
    }
}
