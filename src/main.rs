//! CLI entry point for the offcourse mirror tool.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;

use cli::Args;

/// Log file written into the project folder alongside the mirror.
const LOG_FILE: &str = "crawl.log";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // The project folder hosts the state records and the log file, so it has
    // to exist before anything else.
    std::fs::create_dir_all(&args.project_folder)?;

    // Log level: RUST_LOG env var wins, default info. Everything is mirrored
    // into crawl.log inside the project folder for post-mortems of long runs.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let file_appender = tracing_appender::rolling::never(&args.project_folder, LOG_FILE);
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    run(args).await
}

#[cfg(feature = "browser")]
async fn run(args: Args) -> Result<()> {
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::{Context, bail};
    use tracing::info;

    use offcourse_core::config::{
        BASE_URL, DEFAULT_COOKIE_FILE, DEFAULT_USER_AGENT_FILE, MODULES_TO_CRAWL,
    };
    use offcourse_core::crawl::seed_queue;
    use offcourse_core::session::{BrowserSessionFactory, SessionFactory};
    use offcourse_core::{
        CrawlConfig, CrawlState, Crawler, Credentials, Downloader, ModuleCatalog, StateStore,
        Supervisor, rewrite,
    };

    info!("offcourse starting");

    let credentials = Arc::new(
        Credentials::load(
            Path::new(DEFAULT_COOKIE_FILE),
            Path::new(DEFAULT_USER_AGENT_FILE),
        )
        .context("loading request identity")?,
    );
    let config = CrawlConfig::new(args.project_folder.clone(), (*credentials).clone());
    let store = StateStore::new(&args.project_folder);

    let mut state = match store.load().context("loading persisted crawl state")? {
        Some(state) => {
            info!(
                modules_left = state.queue.len(),
                lessons_done = state.visited.len(),
                "resuming previous crawl"
            );
            state
        }
        None => {
            info!("first run, reading the navigation page to seed the work queue");
            let factory = BrowserSessionFactory::new(Arc::clone(&credentials));
            let mut session = factory.create().await.context("starting browser")?;
            let nav_html = session.fetch_page(BASE_URL).await;
            session.close().await;

            let nav_html = match nav_html {
                Ok(Some(html)) => html,
                Ok(None) => bail!("navigation page {BASE_URL} came back empty"),
                Err(e) => bail!("failed to load the navigation page {BASE_URL}: {e}"),
            };

            let catalog =
                ModuleCatalog::parse(&nav_html, BASE_URL).context("reading module catalog")?;
            let queue: VecDeque<String> = seed_queue(&catalog, MODULES_TO_CRAWL, BASE_URL);
            info!(modules = queue.len(), "work queue seeded");

            let state = CrawlState::seeded(queue, BASE_URL);
            store.save_queue(&state.queue)?;
            store.save_visited(&state.visited)?;
            state
        }
    };

    let factory = Box::new(BrowserSessionFactory::new(Arc::clone(&credentials)));
    let crawler = Crawler::new(config, factory)?;
    Supervisor::default().run(&crawler, &mut state).await?;

    info!("crawl finished, running offline rewrite");
    let downloader = Downloader::new(&credentials)?;
    let rewrite_stats = rewrite::rewrite_project(&args.project_folder, &downloader).await?;
    info!(
        pages = rewrite_stats.pages,
        failed = rewrite_stats.failed,
        "offline rewrite finished"
    );

    rewrite::sanitize_tree(&args.project_folder)?;
    info!("mirror complete: {}", args.project_folder.display());
    Ok(())
}

#[cfg(not(feature = "browser"))]
async fn run(_args: Args) -> Result<()> {
    anyhow::bail!("browser support not compiled. Rebuild with: cargo build --features browser")
}
