//! Typed extraction of course structure from rendered HTML.
//!
//! Two page shapes matter: the navigation page (module catalog in the left
//! bar) and the lesson page (breadcrumbs, player, downloads, assessment,
//! sibling list). Extraction is synchronous and returns owned data, so the
//! parsed DOM never crosses an await point.
//!
//! Absent-vs-empty: a missing optional container (downloads box, player
//! JSON, assessment wrapper, sibling listing) yields `None`/an empty vec. A
//! missing breadcrumb trail is an error — nothing else on the page can be
//! located on disk without it.

use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Errors raised during extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The page has no breadcrumb trail, so it is not a lesson page.
    #[error("page has no breadcrumb trail")]
    MissingBreadcrumbs,

    /// The base URL the page's links are joined against is invalid.
    #[error("invalid base URL: {url}")]
    InvalidBaseUrl {
        /// The offending base URL.
        url: String,
    },

    /// A CSS selector failed to compile.
    #[error("invalid selector {selector}: {reason}")]
    Selector {
        /// The selector source.
        selector: String,
        /// Parser message.
        reason: String,
    },
}

fn selector(source: &str) -> Result<Selector, ExtractError> {
    Selector::parse(source).map_err(|e| ExtractError::Selector {
        selector: source.to_string(),
        reason: e.to_string(),
    })
}

fn join(base: &Url, href: &str) -> Option<String> {
    base.join(href).ok().map(|u| u.to_string())
}

/// One downloadable attachment offered by a lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Display name from the download box.
    pub name: String,
    /// Absolute download URL.
    pub url: String,
}

/// Everything extracted from one lesson page.
#[derive(Debug, Clone)]
pub struct LessonPage {
    /// Lesson title (last breadcrumb segment).
    pub title: String,
    /// Breadcrumb trail joined with `/`, used as the on-disk save path.
    pub breadcrumb_path: String,
    /// HLS playlist URL of the lesson video, when the page has a player.
    pub video_url: Option<String>,
    /// Attachments from the download box; empty when the box is absent.
    pub attachments: Vec<Attachment>,
    /// Embedded assessment page URL (query string stripped), when present.
    pub assessment_url: Option<String>,
    /// Sibling lesson URLs for the whole section, entry page first. Empty
    /// when the page carries no section listing.
    pub lessons: Vec<String>,
}

impl LessonPage {
    /// Extracts lesson metadata from rendered HTML.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::MissingBreadcrumbs`] for pages without a
    /// breadcrumb trail and [`ExtractError::InvalidBaseUrl`] when `base_url`
    /// does not parse.
    pub fn parse(html: &str, base_url: &str) -> Result<Self, ExtractError> {
        let base = Url::parse(base_url).map_err(|_| ExtractError::InvalidBaseUrl {
            url: base_url.to_string(),
        })?;
        let document = Html::parse_document(html);

        let breadcrumbs = selector("div.breadcrumbs")?;
        let trail: String = document
            .select(&breadcrumbs)
            .next()
            .ok_or(ExtractError::MissingBreadcrumbs)?
            .text()
            .collect();

        let segments: Vec<String> = trail.split('/').map(|s| s.trim().to_string()).collect();
        let title = segments
            .last()
            .cloned()
            .filter(|s| !s.is_empty())
            .ok_or(ExtractError::MissingBreadcrumbs)?;
        let breadcrumb_path = segments.join("/");

        Ok(Self {
            title,
            breadcrumb_path,
            video_url: find_video(&document)?,
            attachments: find_attachments(&document, &base)?,
            assessment_url: find_assessment(&document, &base)?,
            lessons: find_section_lessons(&document, &base)?,
        })
    }
}

/// Video URL from the player's JSON-LD block, when present and non-empty.
fn find_video(document: &Html) -> Result<Option<String>, ExtractError> {
    let json_ld = selector("script.w-json-ld")?;
    let Some(script) = document.select(&json_ld).next() else {
        return Ok(None);
    };
    let raw: String = script.text().collect();
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    Ok(value
        .get("contentUrl")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from))
}

/// Attachments from the download box; empty when the box is absent.
fn find_attachments(document: &Html, base: &Url) -> Result<Vec<Attachment>, ExtractError> {
    let container = selector("div.download_cont")?;
    let anchors = selector("a")?;
    let label = selector("span")?;

    let Some(downloads) = document.select(&container).next() else {
        return Ok(Vec::new());
    };

    let mut attachments = Vec::new();
    for anchor in downloads.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let name: String = anchor
            .select(&label)
            .next()
            .map(|span| span.text().collect::<String>())
            .unwrap_or_default();
        if let Some(url) = join(base, href) {
            attachments.push(Attachment {
                name: name.trim().to_string(),
                url,
            });
        }
    }
    Ok(attachments)
}

/// Assessment URL from the embedded iframe, query string stripped.
fn find_assessment(document: &Html, base: &Url) -> Result<Option<String>, ExtractError> {
    let wrapper = selector("div.assessment-wrapper iframe")?;
    let Some(iframe) = document.select(&wrapper).next() else {
        return Ok(None);
    };
    let Some(src) = iframe.value().attr("src") else {
        return Ok(None);
    };
    let without_query = src.split('?').next().unwrap_or(src);
    Ok(join(base, without_query))
}

/// Sibling lesson URLs for the section, entry page first.
fn find_section_lessons(document: &Html, base: &Url) -> Result<Vec<String>, ExtractError> {
    let listing = selector("div.category-listing")?;
    let anchors = selector("a")?;

    let Some(section) = document.select(&listing).next() else {
        return Ok(Vec::new());
    };

    Ok(section
        .select(&anchors)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| join(base, href))
        .collect())
}

/// One top-level navigation module.
#[derive(Debug, Clone)]
pub struct Module {
    /// Display name in the navigation bar.
    pub name: String,
    /// Direct lesson-list link, when the module itself is clickable.
    pub link: Option<String>,
    /// Ordered (name, link) pairs of submodules.
    pub submodules: Vec<(String, String)>,
}

/// The navigation page's module listing, in page order.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    /// Modules in navigation order.
    pub modules: Vec<Module>,
}

impl ModuleCatalog {
    /// Extracts the module catalog from the navigation page.
    ///
    /// Modules without a readable name are skipped; submodules missing a link
    /// or a name are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidBaseUrl`] when `base_url` does not
    /// parse.
    pub fn parse(html: &str, base_url: &str) -> Result<Self, ExtractError> {
        let base = Url::parse(base_url).map_err(|_| ExtractError::InvalidBaseUrl {
            url: base_url.to_string(),
        })?;
        let document = Html::parse_document(html);

        let menu = selector("li.cat_menu")?;
        let anchors = selector("a")?;
        let submenu = selector("li.cat_list")?;
        let label = selector("p")?;

        let mut modules = Vec::new();
        for item in document.select(&menu) {
            let Some(first_anchor) = item.select(&anchors).next() else {
                continue;
            };
            let name = first_anchor.text().collect::<String>().trim().to_string();
            if name.is_empty() {
                continue;
            }

            let link = first_anchor
                .value()
                .attr("href")
                .and_then(|href| join(&base, href));

            let submodules = item
                .select(&submenu)
                .filter_map(|sub| submodule_entry(&sub, &anchors, &label, &base))
                .collect();

            modules.push(Module {
                name,
                link,
                submodules,
            });
        }

        Ok(Self { modules })
    }

    /// Looks a module up by its display name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.name == name)
    }
}

fn submodule_entry(
    item: &ElementRef<'_>,
    anchors: &Selector,
    label: &Selector,
    base: &Url,
) -> Option<(String, String)> {
    let href = item.select(anchors).next()?.value().attr("href")?;
    let name = item
        .select(label)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }
    let link = join(base, href)?;
    Some((name, link))
}
