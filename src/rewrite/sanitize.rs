//! Post-crawl sanitation walk: rename mirrored folders and files whose names
//! carry characters outside the sanitation rules, then fix the video
//! references inside processed pages so they still point at the renamed
//! files.
//!
//! Asset subfolders (`css`, `js`, `img`) and `assessment` folders are left
//! alone; their names are generated, never derived from page text.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};

use super::PROCESSED_SUFFIX;
use crate::paths;

/// Folder names the rename walk never touches.
const GENERATED_DIRS: &[&str] = &["css", "js", "img", "assessment"];

/// File extensions included in the rename walk.
const RENAME_EXTENSIONS: &[&str] = &["html", "css", "png", "mp3", "pdf", "zip", "mp4"];

/// Outcome counts for one sanitation walk.
#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizeStats {
    /// Folders renamed.
    pub dirs_renamed: usize,
    /// Files renamed.
    pub files_renamed: usize,
}

/// Renames unsanitary folder and file names under `project_dir` and patches
/// video references in processed pages. Rename failures are logged and
/// skipped; only a failed directory walk aborts.
///
/// # Errors
///
/// Returns the IO error when the tree cannot be walked.
pub fn sanitize_tree(project_dir: &Path) -> std::io::Result<SanitizeStats> {
    let mut stats = SanitizeStats::default();

    // Files first: renaming a file never invalidates other collected paths.
    for file in collect(project_dir, false)? {
        if rename_if_needed(&file) {
            stats.files_renamed += 1;
        }
    }

    // Directories bottom-up so a rename never invalidates a deeper path.
    let mut dirs = collect(project_dir, true)?;
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        if rename_if_needed(&dir) {
            stats.dirs_renamed += 1;
        }
    }

    fix_video_sources(project_dir)?;

    info!(
        dirs = stats.dirs_renamed,
        files = stats.files_renamed,
        "sanitation walk complete"
    );
    Ok(stats)
}

/// Collects directories or files under `root`, skipping generated folders.
fn collect(root: &Path, dirs: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                if is_generated_dir(&path) {
                    continue;
                }
                pending.push(path.clone());
                if dirs {
                    out.push(path);
                }
            } else if !dirs && has_rename_extension(&path) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn is_generated_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| GENERATED_DIRS.contains(&name))
}

fn has_rename_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| RENAME_EXTENSIONS.contains(&ext))
}

/// Renames one entry when its name breaks the sanitation rules. Returns true
/// when a rename happened.
fn rename_if_needed(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if paths::is_sanitized(name) {
        return false;
    }

    let new_path = path.with_file_name(paths::sanitize(name));
    debug!(from = %path.display(), to = %new_path.display(), "renaming");
    match std::fs::rename(path, &new_path) {
        Ok(()) => true,
        Err(e) => {
            warn!(from = %path.display(), error = %e, "rename failed");
            false
        }
    }
}

/// Sanitizes `<source src>` values inside processed pages so they match the
/// renamed video files.
fn fix_video_sources(project_dir: &Path) -> std::io::Result<()> {
    let Ok(source_attr) = Regex::new(r#"(?is)<source\b[^>]*src="([^"]*)""#) else {
        return Ok(());
    };

    let mut pending = vec![project_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let is_processed = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem.ends_with(PROCESSED_SUFFIX));
            if !is_processed {
                continue;
            }

            let Ok(html) = std::fs::read_to_string(&path) else {
                continue;
            };
            let fixed = source_attr
                .replace_all(&html, |caps: &regex::Captures<'_>| {
                    let src = &caps[1];
                    if src.is_empty() || paths::is_sanitized(src) {
                        caps[0].to_string()
                    } else {
                        caps[0].replace(src, &paths::sanitize(src))
                    }
                })
                .into_owned();
            if fixed != html {
                if let Err(e) = std::fs::write(&path, fixed) {
                    warn!(page = %path.display(), error = %e, "failed to patch video source");
                }
            }
        }
    }
    Ok(())
}
