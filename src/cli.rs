use crate::{
    format_bytes, format_duration, CaptureError, CaptureItem, CaptureScheduler, ChromiumRenderer,
    Config, FsArtifactStore, JobHandle, JobOutcome, JobState, ViewportSize,
};
use clap::{Parser, Subcommand};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "capture-scheduler")]
#[command(about = "Bounded, deadline-aware web page capture runner")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Directory for stored captures")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "Number of capture workers")]
    pub workers: Option<usize>,

    #[arg(long, help = "Maximum number of queued captures")]
    pub queue_capacity: Option<usize>,

    #[arg(long, help = "Attempts per capture, including the first")]
    pub max_attempts: Option<u32>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single page
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: Url,

        #[arg(short, long, help = "Artifact name")]
        name: String,

        #[arg(long, default_value = "1024", help = "Viewport width")]
        width: u32,

        #[arg(long, default_value = "768", help = "Viewport height")]
        height: u32,

        #[arg(long, default_value = "30", help = "Time budget per attempt in seconds")]
        budget_secs: u64,
    },

    /// Capture every page listed in a file
    Batch {
        #[arg(
            short,
            long,
            help = "Input file, one `url name [width height budget_secs]` per line"
        )]
        input: PathBuf,

        #[arg(long, default_value = "30", help = "Default time budget in seconds")]
        budget_secs: u64,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply command-line overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(output_dir) = &self.output_dir {
            config.output_dir.0 = output_dir.clone();
        }
        if let Some(workers) = self.workers {
            config.scheduler.worker_count = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.scheduler.queue_capacity = capacity;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.scheduler.max_attempts = max_attempts;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.renderer.chrome_path = Some(chrome_path.clone());
        }
    }
}

/// Tally of batch outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub rejected: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &JobOutcome) {
        match outcome.state {
            JobState::Succeeded => self.succeeded += 1,
            JobState::Failed => self.failed += 1,
            JobState::TimedOut => self.timed_out += 1,
            JobState::Cancelled => self.cancelled += 1,
            JobState::Queued | JobState::Running => {}
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out + self.cancelled + self.rejected
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total()
    }
}

pub struct CliRunner {
    pub config: Config,
    pub scheduler: Arc<CaptureScheduler>,
    renderer: Arc<ChromiumRenderer>,
}

impl CliRunner {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let renderer = Arc::new(ChromiumRenderer::launch(&config.renderer).await?);
        let store = Arc::new(FsArtifactStore::new(
            config.output_dir.0.clone(),
            config.renderer.output_format,
        ));

        let scheduler = Arc::new(CaptureScheduler::new(
            config.scheduler.clone(),
            renderer.clone(),
            store,
        )?);

        Ok(Self {
            config,
            scheduler,
            renderer,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Capture {
                url,
                name,
                width,
                height,
                budget_secs,
            } => {
                let item = CaptureItem::from_url(
                    url,
                    name,
                    ViewportSize::new(width, height),
                    Duration::from_secs(budget_secs),
                )?;
                self.run_capture(item).await
            }
            Commands::Batch { input, budget_secs } => {
                let summary = self
                    .run_batch(&input, Duration::from_secs(budget_secs))
                    .await?;
                if summary.all_succeeded() {
                    Ok(())
                } else {
                    let failed = summary.total() - summary.succeeded;
                    Err(format!("{failed} of {} captures failed", summary.total()).into())
                }
            }
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    pub async fn run_capture(&self, item: CaptureItem) -> Result<(), Box<dyn std::error::Error>> {
        info!("Capturing {} as {}", item.url(), item.name());

        let handle = self.scheduler.submit(item)?;
        let outcome = self.scheduler.wait(&handle).await;
        print_outcome(&outcome);

        match outcome.result {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Capture {} ended as {}: {}", outcome.name, outcome.state, e);
                Err(e.into())
            }
        }
    }

    /// Submit every line of `input`, waiting for earlier captures whenever
    /// the queue is full.
    pub async fn run_batch(
        &self,
        input: &Path,
        default_budget: Duration,
    ) -> Result<BatchSummary, Box<dyn std::error::Error>> {
        info!("Starting batch capture from {}", input.display());

        let content = fs::read_to_string(input).await?;
        let items = parse_batch(&content, default_budget)?;
        info!("Loaded {} captures from {}", items.len(), input.display());

        let mut summary = BatchSummary::default();
        let mut pending: VecDeque<JobHandle> = VecDeque::new();

        for item in items {
            let handle = loop {
                match self.scheduler.submit(item.clone()) {
                    Ok(handle) => break Some(handle),
                    Err(CaptureError::QueueFull { .. }) if !pending.is_empty() => {
                        if let Some(oldest) = pending.pop_front() {
                            let outcome = self.scheduler.wait(&oldest).await;
                            print_outcome(&outcome);
                            summary.record(&outcome);
                        }
                    }
                    Err(e) => {
                        warn!("Skipping {}: {}", item.name(), e);
                        summary.rejected += 1;
                        break None;
                    }
                }
            };
            pending.extend(handle);
        }

        for handle in pending {
            let outcome = self.scheduler.wait(&handle).await;
            print_outcome(&outcome);
            summary.record(&outcome);
        }

        info!(
            "Batch completed. Succeeded: {}, Failed: {}, Timed out: {}, Cancelled: {}, Rejected: {}",
            summary.succeeded,
            summary.failed,
            summary.timed_out,
            summary.cancelled,
            summary.rejected
        );
        Ok(summary)
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.renderer.shutdown().await;
    }
}

pub async fn read_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path).await?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

pub async fn validate_config(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration: {}", config_path.display());

    let config = read_config(config_path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Workers: {}", config.scheduler.worker_count);
    println!("  Queue capacity: {}", config.scheduler.queue_capacity);
    println!("  Max attempts: {}", config.scheduler.max_attempts);
    println!("  Output format: {:?}", config.renderer.output_format);
    println!("  Output directory: {}", config.output_dir.0.display());

    Ok(())
}

/// Parse a batch file. Blank lines and `#` comments are skipped.
pub fn parse_batch(
    content: &str,
    default_budget: Duration,
) -> Result<Vec<CaptureItem>, CaptureError> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            parse_batch_line(line, default_budget)
                .map_err(|e| CaptureError::Validation(format!("line {}: {}", index + 1, e)))
                .transpose()
        })
        .collect()
}

/// Parse one `url name [width height [budget_secs]]` line.
pub fn parse_batch_line(
    line: &str,
    default_budget: Duration,
) -> Result<Option<CaptureItem>, CaptureError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let (url, name) = match fields.as_slice() {
        [url, name, ..] => (*url, *name),
        _ => return Err(CaptureError::Validation("expected `url name`".to_string())),
    };

    let viewport = match fields.len() {
        2 => ViewportSize::default(),
        4 | 5 => ViewportSize::new(
            parse_number(fields[2], "width")?,
            parse_number(fields[3], "height")?,
        ),
        n => {
            return Err(CaptureError::Validation(format!(
                "expected 2, 4 or 5 fields, found {n}"
            )))
        }
    };

    let budget = match fields.get(4) {
        Some(secs) => Duration::from_secs(parse_number(secs, "budget_secs")?),
        None => default_budget,
    };

    CaptureItem::new(url, name, viewport, budget).map(Some)
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T, CaptureError> {
    value
        .parse()
        .map_err(|_| CaptureError::Validation(format!("invalid {field}: {value}")))
}

fn print_outcome(outcome: &JobOutcome) {
    let elapsed = outcome
        .started_at
        .and_then(|started| (outcome.finished_at - started).to_std().ok())
        .unwrap_or_default();

    match &outcome.result {
        Ok(artifact) => println!(
            "✓ {} -> {} ({}, {}, attempt {})",
            outcome.name,
            artifact.location,
            format_bytes(artifact.size),
            format_duration(elapsed),
            outcome.attempt + 1
        ),
        Err(e) => println!(
            "✗ {} {} after {} (attempt {}): {}",
            outcome.name,
            outcome.state,
            format_duration(elapsed),
            outcome.attempt + 1,
            e
        ),
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
