//! Headless-Chrome page sessions over the DevTools protocol.
//!
//! Each session launches its own Chrome, overrides the user agent, injects
//! the credential cookies before the first navigation, and serves one module
//! of fetches/captures. A "page crashed" navigation failure restarts the
//! whole browser and retries the navigation once; any other failure, or a
//! failure after the restart, propagates.

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetEmulatedMediaParams;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{PageSession, SessionError, SessionFactory};
use crate::config::Credentials;

/// PDF paper geometry (inches). One very tall page per lesson, backgrounds
/// included, so nothing is lost to pagination.
const PDF_PAPER_WIDTH_IN: f64 = 8.0;
const PDF_PAPER_HEIGHT_IN: f64 = 92.0;

/// A live Chrome instance plus its single page.
pub struct BrowserSession {
    credentials: Arc<Credentials>,
    browser: Browser,
    page: Page,
}

impl BrowserSession {
    /// Launches Chrome and prepares a page with the credential identity.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Launch`] when Chrome cannot be started or the
    /// initial page cannot be prepared.
    pub async fn launch(credentials: Arc<Credentials>) -> Result<Self, SessionError> {
        let config = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .build()
            .map_err(SessionError::launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SessionError::launch(e.to_string()))?;

        // The handler must be polled for the browser connection to make
        // progress; it ends when the browser goes away.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = Self::prepare_page(&browser, &credentials).await?;
        info!("browser session started");

        Ok(Self {
            credentials,
            browser,
            page,
        })
    }

    async fn prepare_page(
        browser: &Browser,
        credentials: &Credentials,
    ) -> Result<Page, SessionError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SessionError::launch(e.to_string()))?;

        page.execute(SetUserAgentOverrideParams::new(
            credentials.user_agent().to_string(),
        ))
        .await
        .map_err(|e| SessionError::launch(e.to_string()))?;

        // Cookies go in before the first navigation so the first request is
        // already authenticated.
        for cookie in credentials.cookies() {
            let mut builder = CookieParam::builder()
                .name(&cookie.name)
                .value(cookie.value());
            if let Some(domain) = &cookie.domain {
                builder = builder.domain(domain);
            }
            if let Some(path) = &cookie.path {
                builder = builder.path(path);
            }
            if let Some(secure) = cookie.secure {
                builder = builder.secure(secure);
            }
            match builder.build() {
                Ok(param) => {
                    if let Err(e) = page.set_cookie(param).await {
                        warn!(name = %cookie.name, error = %e, "failed to set cookie");
                    }
                }
                Err(e) => warn!(name = %cookie.name, error = %e, "failed to build cookie"),
            }
        }

        Ok(page)
    }

    /// Restarts the whole browser after a crash, reusing the same identity.
    async fn restart(&mut self) -> Result<(), SessionError> {
        warn!("restarting crashed browser session");
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;

        let replacement = Self::launch(Arc::clone(&self.credentials)).await?;
        let old = std::mem::replace(self, replacement);
        drop(old);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<Option<String>, chromiumoxide::error::CdpError> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        let html = self.page.content().await?;
        Ok((!html.is_empty()).then_some(html))
    }
}

#[async_trait]
impl PageSession for BrowserSession {
    async fn fetch_page(&mut self, url: &str) -> Result<Option<String>, SessionError> {
        debug!(%url, "loading page");
        match self.navigate(url).await {
            Ok(html) => Ok(html),
            Err(first_error) => {
                let reason = first_error.to_string();
                if !reason.to_lowercase().contains("crash") {
                    return Err(SessionError::navigation(url, reason));
                }

                // Crashed renderer: one restart, one more try.
                self.restart().await?;
                self.navigate(url)
                    .await
                    .map_err(|e| SessionError::navigation(url, e.to_string()))
            }
        }
    }

    async fn screenshot_png(&mut self) -> Result<Vec<u8>, SessionError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| SessionError::capture(e.to_string()))
    }

    async fn print_pdf(&mut self) -> Result<Vec<u8>, SessionError> {
        // Render with screen styles, not print styles; the course pages have
        // no print stylesheet worth keeping.
        self.page
            .execute(SetEmulatedMediaParams::builder().media("screen").build())
            .await
            .map_err(|e| SessionError::capture(e.to_string()))?;

        let params = PrintToPdfParams {
            paper_width: Some(PDF_PAPER_WIDTH_IN),
            paper_height: Some(PDF_PAPER_HEIGHT_IN),
            print_background: Some(true),
            ..Default::default()
        };
        self.page
            .pdf(params)
            .await
            .map_err(|e| SessionError::capture(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        debug!("browser session closed");
    }
}

/// Launches one [`BrowserSession`] per module.
pub struct BrowserSessionFactory {
    credentials: Arc<Credentials>,
}

impl BrowserSessionFactory {
    /// Creates a factory that stamps every session with the same identity.
    #[must_use]
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SessionFactory for BrowserSessionFactory {
    async fn create(&self) -> Result<Box<dyn PageSession>, SessionError> {
        let session = BrowserSession::launch(Arc::clone(&self.credentials)).await?;
        Ok(Box::new(session))
    }
}
