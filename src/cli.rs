//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Mirror an authenticated course site for offline browsing.
///
/// Crawls every configured module, saves each lesson's HTML, screenshot, PDF,
/// video, attachments and assessment into the project folder, then rewrites
/// the saved pages so they work without a network connection. Interrupted
/// runs resume from the state files inside the project folder.
#[derive(Parser, Debug)]
#[command(name = "offcourse")]
#[command(author, version, about)]
pub struct Args {
    /// Output folder for the mirrored course
    pub project_folder: PathBuf,
}
