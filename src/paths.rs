//! Filename and save-path sanitation for mirrored content.
//!
//! Lesson folders are named from breadcrumb text and attachment names come
//! from anchor text, so both can carry characters that are awkward on disk.
//! The rules here are deliberately conservative: they only touch characters
//! that have caused trouble in mirrored trees (`#` breaks fragment-less file
//! URLs, `|` and quotes break shells and archive tools).

use std::path::{Path, PathBuf};

use url::Url;

/// Applies the sanitation rules shared by folder names, file names, and
/// rewritten references inside saved pages.
///
/// `#` and quotes are stripped, `|` becomes `-`, doubled spaces collapse to
/// one, and tabs are removed.
#[must_use]
pub fn sanitize(value: &str) -> String {
    let mut out = value
        .replace('#', "")
        .replace('|', "-")
        .replace('\t', "")
        .replace('\'', "")
        .replace('"', "");
    while out.contains("  ") {
        out = out.replace("  ", " ");
    }
    out
}

/// Returns true when a name already satisfies [`sanitize`].
#[must_use]
pub fn is_sanitized(value: &str) -> bool {
    sanitize(value) == value
}

/// Prefixes the last component of a lesson save path with its ordinal,
/// producing folder names like `3. Past Tense Review`.
#[must_use]
pub fn numbered_lesson_dir(base: &Path, breadcrumb_path: &str, ordinal: usize) -> PathBuf {
    let sanitized = sanitize(breadcrumb_path);
    let mut segments: Vec<&str> = sanitized.split('/').map(str::trim).collect();
    let last = segments.pop().unwrap_or("");
    let mut dir = base.to_path_buf();
    for segment in segments {
        if !segment.is_empty() {
            dir.push(segment);
        }
    }
    dir.push(format!("{ordinal}. {last}"));
    dir
}

/// Builds the on-disk name for one attachment.
///
/// Attachment display names repeat across lessons ("Exercise sheet"), so the
/// batch index keeps them unique, and the extension comes from the URL path
/// because the display name rarely carries one.
#[must_use]
pub fn attachment_filename(index: usize, name: &str, url: &str) -> String {
    let extension = extension_from_url(url).unwrap_or_default();
    sanitize(&format!("{index} - {name}{extension}"))
}

/// Extracts a lowercased extension (including the dot) from a URL path,
/// ignoring query strings. Rejects absurd lengths so querystring noise in the
/// last segment does not become an "extension".
#[must_use]
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Derives a local asset filename from an asset URL (decoded last path
/// segment), for the `css/` / `js/` / `img/` folders the rewrite pass fills.
#[must_use]
pub fn asset_filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    if last_segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last_segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last_segment.to_string());
    Some(sanitize(&decoded))
}
