//! Headless Chromium renderer
//!
//! One browser process serves every worker. Each render opens its own blank
//! tab, sizes it, navigates, captures and closes the tab again, including
//! when the attempt is stopped early.

use crate::{
    create_browser_config, CaptureError, OutputFormat, RenderContext, Renderer, RendererConfig,
    ViewportSize,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

pub struct ChromiumRenderer {
    browser: Mutex<Browser>,
    handler: JoinHandle<Result<(), CdpError>>,
    format: OutputFormat,
}

impl ChromiumRenderer {
    /// Launch Chromium and start polling its DevTools connection.
    pub async fn launch(config: &RendererConfig) -> Result<Self, CaptureError> {
        let instance_id = std::process::id().to_string();
        let browser_config = create_browser_config(config, &instance_id)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::Config(format!("failed to launch browser: {e}")))?;

        // The handler stream drives the CDP connection and must be polled
        // for the browser to make progress.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser handler error: {}", e);
                    return Err(e);
                }
            }
            info!("Browser handler stream ended");
            Ok(())
        });

        info!(format = ?config.output_format, "Chromium renderer launched");

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            format: config.output_format,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down Chromium renderer...");
        if let Err(e) = self.browser.lock().await.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        self.handler.abort();
    }

    /// Size the tab, navigate it and take the screenshot.
    async fn capture(
        &self,
        page: &Page,
        url: &Url,
        viewport: ViewportSize,
    ) -> anyhow::Result<Vec<u8>> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(viewport.width))
            .height(i64::from(viewport.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!("invalid viewport {viewport}: {e}"))?;

        page.execute(metrics).await.context("setting viewport")?;
        page.goto(url.as_str())
            .await
            .with_context(|| format!("loading {url}"))?;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        let png = page.screenshot(params).await.context("capturing screenshot")?;

        convert_image_format(png, self.format)
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(
        &self,
        url: &Url,
        viewport: ViewportSize,
        ctx: &RenderContext,
    ) -> anyhow::Result<Vec<u8>> {
        if !self.is_alive() {
            return Err(anyhow!("browser connection is closed"));
        }

        debug!(%url, %viewport, remaining = ?ctx.remaining(), "Opening page");

        // The browser lock only covers opening a blank tab; navigation runs
        // unlocked so workers load pages in parallel.
        let page = {
            let browser = self.browser.lock().await;
            tokio::select! {
                _ = ctx.stopped() => return Err(anyhow!("stopped before the page opened")),
                page = browser.new_page("about:blank") => page.context("opening a tab")?,
            }
        };

        let result = tokio::select! {
            _ = ctx.stopped() => Err(anyhow!("stopped while capturing {url}")),
            result = self.capture(&page, url, viewport) => result,
        };

        if let Err(e) = page.close().await {
            debug!(%url, "Failed to close page: {}", e);
        }

        result
    }
}

/// Re-encode a PNG capture into `format`.
pub fn convert_image_format(png_data: Vec<u8>, format: OutputFormat) -> anyhow::Result<Vec<u8>> {
    let target = match format {
        OutputFormat::Png => return Ok(png_data),
        OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        OutputFormat::Webp => image::ImageFormat::WebP,
    };

    let img = image::load_from_memory(&png_data).context("decoding capture")?;
    let mut encoded = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut encoded), target)
        .with_context(|| format!("encoding capture as {}", format.extension()))?;

    Ok(encoded)
}
