//! Offline rewrite: make every saved page browsable without the network.
//!
//! Runs once over the whole project folder after the crawl. For each saved
//! page this strips telemetry markup, localizes stylesheet/script/image
//! assets into `css/`, `js/` and `img/` subfolders, swaps the hosted video
//! player for a `<video>` tag pointing at the downloaded file, points the
//! assessment iframe at the saved local copy, and writes the result as a
//! `-offline` suffixed sibling. The original snapshot is left untouched.
//!
//! The DOM is only used read-only to *find* asset references; edits happen as
//! text surgery on the HTML string, so nothing non-`Send` crosses an await.

mod sanitize;

pub use sanitize::sanitize_tree;

use std::path::{Path, PathBuf};

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::download::{DownloadTask, Downloader};
use crate::paths;

/// Suffix marking a processed page copy.
pub const PROCESSED_SUFFIX: &str = "-offline";

/// Substrings that mark a tag as telemetry/tracking; any `script`, `a`,
/// `input`, or `meta` tag containing one is removed outright.
const BLOCK_WORDS: &[&str] = &[
    "user", "analyt", "google", "octa", "chat", "survey", "track", "metric", "token",
];

/// Container blocks removed from every page: account/social chrome, survey
/// boxes, the sidebar download duplicates, audio players that need JS.
const BLOCKED_DIV_MARKERS: &[&str] = &[
    "social_area",
    "btn_vid_after",
    "post-audio",
    "sidebar",
    "survicate-box",
    "octa",
];

/// Errors that abort the whole rewrite pass (per-page failures only log).
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// Walking the project folder failed.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// The folder being scanned.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A rewrite-internal pattern failed to compile.
    #[error("internal pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Outcome counts for one rewrite pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RewriteStats {
    /// Pages successfully rewritten.
    pub pages: usize,
    /// Pages skipped after an error.
    pub failed: usize,
}

/// One asset reference found in a page.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AssetRef {
    /// The reference exactly as it appears in the attribute value.
    original: String,
    /// Absolute download URL.
    url: String,
    /// Destination subfolder: `css`, `js`, or `img`.
    kind: &'static str,
}

/// Rewrites every saved page under `project_dir`.
///
/// # Errors
///
/// Returns [`RewriteError`] when the folder cannot be walked or an internal
/// pattern fails to compile; individual page failures are logged and counted.
pub async fn rewrite_project(
    project_dir: &Path,
    downloader: &Downloader,
) -> Result<RewriteStats, RewriteError> {
    let pages = collect_pages(project_dir)?;
    info!(pages = pages.len(), "rewriting saved pages for offline use");

    let mut stats = RewriteStats::default();
    for page in pages {
        match rewrite_page(&page, downloader).await {
            Ok(()) => stats.pages += 1,
            Err(e) => {
                warn!(page = %page.display(), error = %e, "failed to rewrite page");
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}

/// All saved pages that are not already processed copies.
fn collect_pages(project_dir: &Path) -> Result<Vec<PathBuf>, RewriteError> {
    let mut pages = Vec::new();
    let mut pending = vec![project_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| RewriteError::Scan {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| RewriteError::Scan {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "html")
                && !path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem.ends_with(PROCESSED_SUFFIX))
            {
                pages.push(path);
            }
        }
    }

    pages.sort();
    Ok(pages)
}

async fn rewrite_page(page: &Path, downloader: &Downloader) -> Result<(), RewriteError> {
    let html = std::fs::read_to_string(page).map_err(|source| RewriteError::Scan {
        path: page.to_path_buf(),
        source,
    })?;
    let page_dir = page.parent().unwrap_or(Path::new(".")).to_path_buf();
    let is_assessment = page
        .components()
        .any(|c| c.as_os_str() == "assessment");

    let mut html = strip_telemetry(&html)?;

    // Localize assets. Scripts are only worth keeping on assessment pages;
    // everywhere else they are dropped wholesale below.
    let mut assets = find_assets(&html, "link[rel=\"stylesheet\"]", "href", "css");
    assets.extend(find_assets(&html, "img", "src", "img"));
    if is_assessment {
        assets.extend(find_assets(&html, "script", "src", "js"));
    }

    let mut tasks = Vec::new();
    for asset in &assets {
        let Some(filename) = paths::asset_filename_from_url(&asset.url) else {
            debug!(url = %asset.url, "asset has no usable filename");
            continue;
        };
        let local = format!("{}/{}", asset.kind, filename);
        tasks.push(DownloadTask::new(
            &asset.url,
            page_dir.join(asset.kind).join(&filename),
        ));
        html = html.replace(&asset.original, &local);
    }

    if !is_assessment {
        html = drop_scripts(&html)?;
    }

    if let Some(mp4) = first_mp4_name(&page_dir) {
        html = swap_video_player(&html, &mp4);
    }

    if page_dir.join("assessment").exists() {
        let local_assessment = format!("assessment/assessment_page{PROCESSED_SUFFIX}.html");
        html = point_iframe_at(&html, &local_assessment)?;
    }

    if !tasks.is_empty() {
        let stats = downloader.run_batch(tasks).await;
        if stats.failed() > 0 {
            warn!(
                page = %page.display(),
                failed = stats.failed(),
                "some page assets failed to download"
            );
        }
    }

    let output = processed_path(page);
    std::fs::write(&output, html).map_err(|source| RewriteError::Scan {
        path: output.clone(),
        source,
    })?;
    debug!(page = %output.display(), "processed copy written");
    Ok(())
}

/// Sibling path carrying the processed suffix.
fn processed_path(page: &Path) -> PathBuf {
    let stem = page
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("page");
    page.with_file_name(format!("{stem}{PROCESSED_SUFFIX}.html"))
}

/// Finds asset references via the DOM, returning owned data only.
fn find_assets(html: &str, selector: &str, attr: &str, kind: &'static str) -> Vec<AssetRef> {
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    let mut refs = Vec::new();
    for element in document.select(&sel) {
        let Some(value) = element.value().attr(attr) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() || value.starts_with("data:image") {
            continue;
        }
        refs.push(AssetRef {
            original: value.to_string(),
            url: absolutize(value),
            kind,
        });
    }
    refs
}

/// The course pages ship protocol-relative asset URLs; give them a scheme.
fn absolutize(reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_string()
    } else {
        format!("https:{reference}")
    }
}

/// Removes telemetry markup: all noscript blocks, and any script/a/input/meta
/// tag whose full text contains a block word.
fn strip_telemetry(html: &str) -> Result<String, RewriteError> {
    let noscript = Regex::new(r"(?is)<noscript\b.*?</noscript>")?;
    let mut out = noscript.replace_all(html, "").into_owned();

    let script = Regex::new(r"(?is)<script\b[^>]*>.*?</script>")?;
    out = remove_matching(&script, &out, BLOCK_WORDS);

    let anchor = Regex::new(r"(?is)<a\b[^>]*>.*?</a>")?;
    out = remove_matching(&anchor, &out, BLOCK_WORDS);

    let single = Regex::new(r"(?is)<(?:meta|input)\b[^>]*>")?;
    out = remove_matching(&single, &out, BLOCK_WORDS);

    let broken_img = Regex::new(r#"(?is)<img\b[^>]*src="img/img"[^>]*>"#)?;
    out = broken_img.replace_all(&out, "").into_owned();

    // The flashcard-deck link and the assessment email field only work online.
    out = remove_balanced(&out, "a", "add_deck");
    let email_input = Regex::new(r#"(?is)<input\b[^>]*id="assessment_result_email"[^>]*>"#)?;
    out = email_input.replace_all(&out, "").into_owned();

    for marker in BLOCKED_DIV_MARKERS {
        out = remove_balanced(&out, "div", marker);
    }
    // Walk-and-talk embed pages carry nothing worth keeping offline.
    out = remove_balanced(&out, "body", "containEmbed");

    Ok(out)
}

fn remove_matching(pattern: &Regex, html: &str, block_words: &[&str]) -> String {
    pattern
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let matched = caps[0].to_lowercase();
            if block_words.iter().any(|word| matched.contains(word)) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Removes every remaining script block.
fn drop_scripts(html: &str) -> Result<String, RewriteError> {
    let script = Regex::new(r"(?is)<script\b[^>]*>.*?</script>")?;
    Ok(script.replace_all(html, "").into_owned())
}

/// Removes `<tag ...>...</tag>` blocks whose opening tag contains `marker`,
/// balancing nested tags of the same name.
fn remove_balanced(html: &str, tag: &str, marker: &str) -> String {
    let lower = html.to_lowercase();
    let open_token = format!("<{tag}");
    let close_token = format!("</{tag}>");
    let marker_lower = marker.to_lowercase();

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find(&open_token) {
        let start = cursor + found;
        let Some(tag_end) = lower[start..].find('>') else {
            break;
        };
        let opening = &lower[start..start + tag_end + 1];
        if !opening.contains(&marker_lower) {
            out.push_str(&html[cursor..start + tag_end + 1]);
            cursor = start + tag_end + 1;
            continue;
        }

        // Matching close: count nested opens of the same tag.
        let mut depth = 1;
        let mut scan = start + tag_end + 1;
        let end = loop {
            let next_open = lower[scan..].find(&open_token);
            let next_close = lower[scan..].find(&close_token);
            match (next_open, next_close) {
                (_, None) => break html.len(),
                (Some(o), Some(c)) if o < c => {
                    depth += 1;
                    scan += o + open_token.len();
                }
                (_, Some(c)) => {
                    depth -= 1;
                    scan += c + close_token.len();
                    if depth == 0 {
                        break scan;
                    }
                }
            }
        };

        out.push_str(&html[cursor..start]);
        cursor = end;
    }

    out.push_str(&html[cursor..]);
    out
}

/// First downloaded video in the lesson folder, if any.
fn first_mp4_name(dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".mp4"))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Replaces the hosted player block with a plain `<video>` tag.
fn swap_video_player(html: &str, mp4_name: &str) -> String {
    let replacement = format!(
        r#"<video width="100%" height="auto" controls><source src="{mp4_name}" type="video/mp4"></video>"#
    );

    let without_player = remove_balanced(html, "div", "class=\"video\"");
    if without_player.len() == html.len() {
        // No player block on this page; leave it alone.
        return html.to_string();
    }

    // The player block was removed; put the video tag where the body ends so
    // the lesson is still watchable.
    match without_player.rfind("</body>") {
        Some(idx) => {
            let mut out = without_player.clone();
            out.insert_str(idx, &replacement);
            out
        }
        None => format!("{without_player}{replacement}"),
    }
}

/// Rewrites the first iframe to load the local assessment copy.
fn point_iframe_at(html: &str, local_src: &str) -> Result<String, RewriteError> {
    let iframe = Regex::new(r#"(?is)<iframe\b[^>]*>"#)?;
    let src_attr = Regex::new(r#"(?is)src="[^"]*""#)?;

    let out = iframe.replace(html, |caps: &regex::Captures<'_>| {
        let tag = &caps[0];
        let with_src = if src_attr.is_match(tag) {
            src_attr
                .replace(tag, format!(r#"src="{local_src}""#).as_str())
                .into_owned()
        } else {
            tag.to_string()
        };
        // Keep the embedded quiz tall enough to use without its resize script.
        with_src.replacen('>', r#" style="height: 550px">"#, 1)
    });

    Ok(out.into_owned())
}
