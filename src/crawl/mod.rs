//! Traversal engine: the breadth-first module→lesson walk.
//!
//! One module is processed at a time, from a fresh browser session that is
//! torn down when the module finishes. Within a module the entry page is
//! lesson 1 and the remaining siblings are numbered from 2 in listing order;
//! lessons already in the visited set keep their slot in the numbering but are
//! not refetched. The visited set is persisted after every saved lesson and
//! the queue after every completed module, so a crash at any point loses at
//! most the lesson in flight.
//!
//! Failure granularity: a side effect failing (screenshot, one attachment,
//! the video) never blocks the rest of its lesson; a lesson page failing to
//! load or parse skips only that lesson; the module entry page failing aborts
//! the whole pass for the supervisor to retry.

mod driver;

pub use driver::{Supervisor, SupervisorError};

use std::collections::{HashSet, VecDeque};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::CrawlConfig;
use crate::download::{
    DownloadError, DownloadTask, Downloader, RetryPolicy, VideoDownloader, retry_with_policy,
};
use crate::extract::{ExtractError, LessonPage};
use crate::paths;
use crate::session::{PageSession, SessionError, SessionFactory};
use crate::state::{CrawlState, StateError, StateStore};

/// Call-site attempt budget for one lesson's video.
const VIDEO_ATTEMPTS: u32 = 3;

/// File name used for a saved assessment page, under the lesson's
/// `assessment/` subfolder.
const ASSESSMENT_PAGE: &str = "assessment_page.html";

/// Errors that abort a whole crawl pass.
///
/// Everything below module granularity is handled inside the pass; these are
/// the failures the supervisor sees.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// A browser session could not be created.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A module entry page could not be fetched.
    #[error("module entry page failed to load: {url}: {reason}")]
    ModuleFetch {
        /// The module entry URL.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// A module entry page fetched but did not extract as a lesson page.
    #[error("module entry page failed to extract: {url}: {source}")]
    ModuleExtract {
        /// The module entry URL.
        url: String,
        /// The underlying extraction error.
        #[source]
        source: ExtractError,
    },

    /// Persisting crawl state failed; continuing would lose progress.
    #[error(transparent)]
    State(#[from] StateError),

    /// The download subsystem could not be constructed.
    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl CrawlError {
    fn module_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModuleFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// The traversal engine.
pub struct Crawler {
    config: CrawlConfig,
    store: StateStore,
    sessions: Box<dyn SessionFactory>,
    downloader: Downloader,
    video: VideoDownloader,
}

impl Crawler {
    /// Builds a crawler over the given session factory.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Download`] when the credential bundle cannot be
    /// turned into HTTP clients.
    pub fn new(config: CrawlConfig, sessions: Box<dyn SessionFactory>) -> Result<Self, CrawlError> {
        let downloader = Downloader::new(&config.credentials)?;
        let video = VideoDownloader::new(&config.credentials)?;
        let store = StateStore::new(&config.project_dir);
        Ok(Self {
            config,
            store,
            sessions,
            downloader,
            video,
        })
    }

    /// The state store this crawler persists through.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Runs one full pass: processes queue-head modules until the queue is
    /// empty or a module-level failure aborts the pass.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError`] on module-level failures. Persisted state
    /// reflects every module committed before the failure, so a rerun resumes
    /// at the failing module.
    pub async fn run_pass(&self, state: &mut CrawlState) -> Result<(), CrawlError> {
        while let Some(module_url) = state.queue.front().cloned() {
            info!(url = %module_url, remaining = state.queue.len(), "processing module");

            let mut session = self.sessions.create().await?;
            let outcome = self
                .process_module(session.as_mut(), &module_url, state)
                .await;
            // One session per module: tear the browser down before deciding
            // anything else, so a pass abort can't leak it.
            session.close().await;
            outcome?;

            state.queue.pop_front();
            state.visited.insert(module_url);
            self.store.save_queue(&state.queue)?;
            self.store.save_visited(&state.visited)?;
        }

        info!("work queue empty, traversal complete");
        Ok(())
    }

    /// Processes every lesson of the module whose entry page is `module_url`.
    /// Does not dequeue; the caller commits on success.
    async fn process_module(
        &self,
        session: &mut dyn PageSession,
        module_url: &str,
        state: &mut CrawlState,
    ) -> Result<(), CrawlError> {
        let entry_html = match session.fetch_page(module_url).await {
            Ok(Some(html)) => html,
            Ok(None) => return Err(CrawlError::module_fetch(module_url, "empty page")),
            Err(e) => return Err(CrawlError::module_fetch(module_url, e.to_string())),
        };

        let entry = LessonPage::parse(&entry_html, &self.config.base_url).map_err(|source| {
            CrawlError::ModuleExtract {
                url: module_url.to_string(),
                source,
            }
        })?;
        let siblings = entry.lessons.clone();

        // The entry page is lesson 1 of its section. It is intentionally
        // re-saved when a pass re-enters a partially crawled module.
        self.save_lesson(session, &entry, &entry_html, 1).await;

        let bar = lesson_progress_bar(siblings.len().saturating_sub(1), &entry.title);
        // Index 0 is the entry page itself.
        for (index, lesson_url) in siblings.iter().enumerate().skip(1) {
            let ordinal = index + 1;
            bar.inc(1);

            if state.visited.contains(lesson_url) {
                info!(url = %lesson_url, "skipping already visited lesson");
                continue;
            }

            let lesson_html = match session.fetch_page(lesson_url).await {
                Ok(Some(html)) => html,
                Ok(None) => {
                    warn!(url = %lesson_url, "lesson page failed to load");
                    continue;
                }
                Err(e) => {
                    warn!(url = %lesson_url, error = %e, "lesson page failed to load");
                    continue;
                }
            };
            let lesson = match LessonPage::parse(&lesson_html, &self.config.base_url) {
                Ok(lesson) => lesson,
                Err(e) => {
                    warn!(url = %lesson_url, error = %e, "lesson page failed to extract");
                    continue;
                }
            };

            self.save_lesson(session, &lesson, &lesson_html, ordinal).await;

            state.visited.insert(lesson_url.clone());
            self.store.save_visited(&state.visited)?;
        }
        bar.finish_and_clear();

        Ok(())
    }

    /// Saves every artifact of one lesson. Each step is best-effort: a
    /// failure is logged and the remaining steps still run.
    async fn save_lesson(
        &self,
        session: &mut dyn PageSession,
        lesson: &LessonPage,
        html: &str,
        ordinal: usize,
    ) {
        let dir = paths::numbered_lesson_dir(&self.config.project_dir, &lesson.breadcrumb_path, ordinal);
        let title = paths::sanitize(&lesson.title);
        info!(
            title = %lesson.title,
            path = %dir.display(),
            video = lesson.video_url.is_some(),
            attachments = lesson.attachments.len(),
            assessment = lesson.assessment_url.is_some(),
            "saving lesson"
        );

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            // Without the folder nothing below can land anywhere.
            warn!(path = %dir.display(), error = %e, "failed to create lesson folder");
            return;
        }

        let html_path = dir.join(format!("{title}.html"));
        if let Err(e) = tokio::fs::write(&html_path, html).await {
            warn!(path = %html_path.display(), error = %e, "failed to save lesson html");
        }

        match session.screenshot_png().await {
            Ok(png) => {
                let png_path = dir.join(format!("{title}.png"));
                if let Err(e) = tokio::fs::write(&png_path, png).await {
                    warn!(path = %png_path.display(), error = %e, "failed to save screenshot");
                }
            }
            Err(e) => warn!(title = %title, error = %e, "failed to capture screenshot"),
        }

        match session.print_pdf().await {
            Ok(pdf) => {
                let pdf_path = dir.join(format!("{title}.pdf"));
                if let Err(e) = tokio::fs::write(&pdf_path, pdf).await {
                    warn!(path = %pdf_path.display(), error = %e, "failed to save pdf");
                }
            }
            Err(e) => warn!(title = %title, error = %e, "failed to render pdf"),
        }

        if let Some(video_url) = &lesson.video_url {
            self.save_video(video_url, &dir, &title).await;
        }

        if !lesson.attachments.is_empty() {
            let tasks: Vec<DownloadTask> = lesson
                .attachments
                .iter()
                .enumerate()
                .map(|(index, attachment)| {
                    let filename =
                        paths::attachment_filename(index, &attachment.name, &attachment.url);
                    DownloadTask::new(&attachment.url, dir.join(filename))
                })
                .collect();
            let stats = self.downloader.run_batch(tasks).await;
            if stats.failed() > 0 {
                warn!(
                    failed = stats.failed(),
                    completed = stats.completed(),
                    "some attachments failed"
                );
            }
        }

        if let Some(assessment_url) = &lesson.assessment_url {
            self.save_assessment(session, assessment_url, &dir).await;
        }
    }

    /// Downloads and assembles the lesson video unless it already exists.
    async fn save_video(&self, video_url: &str, dir: &std::path::Path, title: &str) {
        let dest = dir.join(format!("{title}.mp4"));
        if dest.exists() {
            info!(path = %dest.display(), "video already exists, skipping");
            return;
        }

        // Every failure burns an attempt, playlist errors included: each
        // retry re-runs the whole assembly from the playlist fetch.
        let policy = RetryPolicy::immediate_all(VIDEO_ATTEMPTS);
        let result = retry_with_policy(&policy, |attempt| {
            if attempt > 1 {
                info!(attempt, url = %video_url, "retrying video download");
            }
            self.video.download(video_url, &dest)
        })
        .await;

        if let Err((error, attempts)) = result {
            warn!(url = %video_url, %error, attempts, "video download failed");
        }
    }

    /// Fetches the assessment page and saves it under `assessment/`.
    async fn save_assessment(
        &self,
        session: &mut dyn PageSession,
        assessment_url: &str,
        dir: &std::path::Path,
    ) {
        info!(url = %assessment_url, "saving assessment page");
        let html = match session.fetch_page(assessment_url).await {
            Ok(Some(html)) => html,
            Ok(None) => {
                warn!(url = %assessment_url, "assessment page failed to load");
                return;
            }
            Err(e) => {
                warn!(url = %assessment_url, error = %e, "assessment page failed to load");
                return;
            }
        };

        let assessment_dir = dir.join("assessment");
        if let Err(e) = tokio::fs::create_dir_all(&assessment_dir).await {
            warn!(path = %assessment_dir.display(), error = %e, "failed to create assessment folder");
            return;
        }
        let page_path = assessment_dir.join(ASSESSMENT_PAGE);
        if let Err(e) = tokio::fs::write(&page_path, html).await {
            warn!(path = %page_path.display(), error = %e, "failed to save assessment page");
        }
    }
}

/// Seeds the work queue from the navigation catalog.
///
/// Walks `module_names` in the given order, appending each named module's
/// direct link and then its submodule links. Links are deduplicated in first-
/// seen order, and the root URL is never enqueued. Names missing from the
/// catalog are logged and skipped (different markets carry different module
/// sets).
#[must_use]
pub fn seed_queue(
    catalog: &crate::extract::ModuleCatalog,
    module_names: &[&str],
    root_url: &str,
) -> VecDeque<String> {
    let mut queue = VecDeque::new();
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(root_url.to_string());

    for name in module_names {
        let Some(module) = catalog.get(name) else {
            info!(module = %name, "module not present on the navigation page");
            continue;
        };

        if let Some(link) = &module.link {
            if seen.insert(link.clone()) {
                queue.push_back(link.clone());
            }
        }
        for (_, link) in &module.submodules {
            if seen.insert(link.clone()) {
                queue.push_back(link.clone());
            }
        }
    }

    queue
}

fn lesson_progress_bar(lessons: usize, module_title: &str) -> ProgressBar {
    let bar = ProgressBar::new(lessons as u64);
    if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}") {
        bar.set_style(style);
    }
    bar.set_message(module_title.to_string());
    bar
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::extract::ModuleCatalog;

    const BASE: &str = "https://courses.example.com/";

    fn catalog() -> ModuleCatalog {
        let html = r#"<ul>
            <li class="cat_menu"><a href="/m/welcome">Welcome</a></li>
            <li class="cat_menu">
                <a href="/m/wave1">Wave 01</a>
                <ul>
                    <li class="cat_list"><a href="/m/wave1-a"><p>Basics</p></a></li>
                    <li class="cat_list"><a href="/m/wave1"><p>Repeat of direct link</p></a></li>
                </ul>
            </li>
        </ul>"#;
        ModuleCatalog::parse(html, BASE).unwrap()
    }

    #[test]
    fn test_seed_queue_follows_requested_order() {
        let queue = seed_queue(&catalog(), &["Wave 01", "Welcome"], BASE);
        assert_eq!(
            Vec::from(queue),
            vec![
                "https://courses.example.com/m/wave1".to_string(),
                "https://courses.example.com/m/wave1-a".to_string(),
                "https://courses.example.com/m/welcome".to_string(),
            ]
        );
    }

    #[test]
    fn test_seed_queue_deduplicates_links() {
        // "Repeat of direct link" points at the module's own link.
        let queue = seed_queue(&catalog(), &["Wave 01"], BASE);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_seed_queue_skips_missing_modules() {
        let queue = seed_queue(&catalog(), &["Extras", "Welcome"], BASE);
        assert_eq!(
            Vec::from(queue),
            vec!["https://courses.example.com/m/welcome".to_string()]
        );
    }

    #[test]
    fn test_seed_queue_never_enqueues_the_root() {
        let html = r#"<li class="cat_menu"><a href="/">Welcome</a></li>"#;
        let catalog = ModuleCatalog::parse(html, BASE).unwrap();
        let queue = seed_queue(&catalog, &["Welcome"], BASE);
        assert!(queue.is_empty());
    }
}
