//! Rendered-page capability: fetch HTML, capture screenshots and PDFs.
//!
//! The traversal engine only sees the [`PageSession`] and [`SessionFactory`]
//! traits; the production implementation drives headless Chrome over the
//! DevTools protocol (behind the `browser` feature), and tests substitute a
//! scripted session. One session serves exactly one module and is torn down
//! when the module completes.

use async_trait::async_trait;

#[cfg(feature = "browser")]
pub mod browser;

#[cfg(feature = "browser")]
pub use browser::{BrowserSession, BrowserSessionFactory};

/// Errors raised by a page session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying browser could not be started or connected.
    #[error("failed to launch browser session: {reason}")]
    Launch {
        /// What went wrong.
        reason: String,
    },

    /// Navigating to a URL failed, including after a crash-restart retry.
    #[error("failed to load {url}: {reason}")]
    Navigation {
        /// The URL that failed to load.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Screenshot or PDF capture of the current page failed.
    #[error("failed to capture page: {reason}")]
    Capture {
        /// What went wrong.
        reason: String,
    },
}

impl SessionError {
    /// Creates a launch error.
    pub fn launch(reason: impl Into<String>) -> Self {
        Self::Launch {
            reason: reason.into(),
        }
    }

    /// Creates a navigation error.
    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a capture error.
    pub fn capture(reason: impl Into<String>) -> Self {
        Self::Capture {
            reason: reason.into(),
        }
    }
}

/// One browser lifetime: navigation plus capture of the current page.
#[async_trait]
pub trait PageSession: Send {
    /// Navigates to `url` and returns its rendered HTML.
    ///
    /// `Ok(None)` means the page loaded but produced no usable document. The
    /// implementation is expected to recover from a crashed-page failure by
    /// restarting itself and retrying the navigation exactly once; a second
    /// failure surfaces as [`SessionError::Navigation`].
    async fn fetch_page(&mut self, url: &str) -> Result<Option<String>, SessionError>;

    /// Captures a full-page PNG of the current page.
    async fn screenshot_png(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Renders the current page as a paginated PDF.
    async fn print_pdf(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Tears the session down. Dropping without closing leaks the browser
    /// process until the parent exits.
    async fn close(&mut self);
}

/// Creates one [`PageSession`] per module.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Starts a fresh session.
    async fn create(&self) -> Result<Box<dyn PageSession>, SessionError>;
}
