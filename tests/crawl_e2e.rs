//! End-to-end traversal tests with a scripted page session.
//!
//! The scripted session serves rendered HTML from an in-memory site map and
//! records every fetch, so the tests can assert exactly what the traversal
//! engine touched. Attachments and videos go over a real local HTTP server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use offcourse_core::config::CookieEntry;
use offcourse_core::{
    CrawlConfig, CrawlState, Crawler, Credentials, PageSession, SessionError, SessionFactory,
    StateStore, Supervisor, SupervisorError,
};

const BASE: &str = "https://courses.example.com/";
const ROOT: &str = "https://courses.example.com/";

fn test_credentials() -> Credentials {
    let cookie: CookieEntry = serde_json::from_str(r#"{"name":"session","value":"abc"}"#).unwrap();
    Credentials::new(vec![cookie], "offcourse-test/1.0".to_string())
}

fn test_config(project_dir: &TempDir) -> CrawlConfig {
    CrawlConfig {
        project_dir: project_dir.path().to_path_buf(),
        base_url: BASE.to_string(),
        credentials: test_credentials(),
    }
}

/// Builds a lesson page in the structure the extractor expects.
fn lesson_html(
    unit: &str,
    title: &str,
    siblings: &[&str],
    video: Option<&str>,
    attachments: &[(&str, &str)],
    assessment: Option<&str>,
) -> String {
    let mut html = String::new();
    html.push_str("<html><body>");
    html.push_str(&format!(
        r#"<div class="breadcrumbs"> English Course / {unit} / {title} </div>"#
    ));
    if let Some(video_url) = video {
        html.push_str(&format!(
            r#"<script class="w-json-ld">{{"contentUrl":"{video_url}"}}</script>"#
        ));
    }
    if !attachments.is_empty() {
        html.push_str(r#"<div class="download_cont">"#);
        for (name, url) in attachments {
            html.push_str(&format!(r#"<a href="{url}"><span>{name}</span></a>"#));
        }
        html.push_str("</div>");
    }
    if let Some(assessment_url) = assessment {
        html.push_str(&format!(
            r#"<div class="assessment-wrapper"><iframe src="{assessment_url}?embed=1"></iframe></div>"#
        ));
    }
    html.push_str(r#"<div class="category-listing"><h3 class="title">Section</h3>"#);
    for sibling in siblings {
        html.push_str(&format!(r#"<a href="{sibling}">lesson</a>"#));
    }
    html.push_str("</div></body></html>");
    html
}

/// Serves pages from a shared map and records every fetch.
struct ScriptedSession {
    pages: Arc<Mutex<HashMap<String, String>>>,
    fail_once: Arc<Mutex<HashSet<String>>>,
    fail_always: Arc<HashSet<String>>,
    fetch_log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn fetch_page(&mut self, url: &str) -> Result<Option<String>, SessionError> {
        self.fetch_log.lock().unwrap().push(url.to_string());
        if self.fail_always.contains(url) {
            return Ok(None);
        }
        if self.fail_once.lock().unwrap().remove(url) {
            return Ok(None);
        }
        Ok(self.pages.lock().unwrap().get(url).cloned())
    }

    async fn screenshot_png(&mut self) -> Result<Vec<u8>, SessionError> {
        Ok(b"PNG-BYTES".to_vec())
    }

    async fn print_pdf(&mut self) -> Result<Vec<u8>, SessionError> {
        Ok(b"%PDF-BYTES".to_vec())
    }

    async fn close(&mut self) {}
}

#[derive(Default)]
struct ScriptedFactory {
    pages: Arc<Mutex<HashMap<String, String>>>,
    fail_once: Arc<Mutex<HashSet<String>>>,
    fail_always: Arc<HashSet<String>>,
    fetch_log: Arc<Mutex<Vec<String>>>,
    sessions_created: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    fn with_pages(pages: HashMap<String, String>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(pages)),
            ..Self::default()
        }
    }

    fn handle(&self) -> (Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        (
            Arc::clone(&self.fetch_log),
            Arc::clone(&self.sessions_created),
        )
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(&self) -> Result<Box<dyn PageSession>, SessionError> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            pages: Arc::clone(&self.pages),
            fail_once: Arc::clone(&self.fail_once),
            fail_always: Arc::clone(&self.fail_always),
            fetch_log: Arc::clone(&self.fetch_log),
        }))
    }
}

fn url(path: &str) -> String {
    format!("{BASE}{path}")
}

/// Two-lesson module: entry page plus one sibling, no media.
fn simple_module_pages() -> HashMap<String, String> {
    let entry = url("lesson/one");
    let sibling = url("lesson/two");
    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html("Unit 1", "Lesson One", &[&entry, &sibling], None, &[], None),
    );
    pages.insert(
        sibling.clone(),
        lesson_html("Unit 1", "Lesson Two", &[&entry, &sibling], None, &[], None),
    );
    pages
}

#[tokio::test]
async fn end_to_end_single_module_two_lessons() {
    let project = TempDir::new().unwrap();
    let factory = ScriptedFactory::with_pages(simple_module_pages());
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let mut state = CrawlState::seeded(VecDeque::from([url("lesson/one")]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    // Queue drained, visited holds root + entry + sibling.
    assert!(state.queue.is_empty());
    let expected: HashSet<String> = [ROOT.to_string(), url("lesson/one"), url("lesson/two")]
        .into_iter()
        .collect();
    assert_eq!(state.visited, expected);

    // Both lesson folders exist with all three artifacts.
    let unit = project.path().join("English Course").join("Unit 1");
    for (folder, title) in [("1. Lesson One", "Lesson One"), ("2. Lesson Two", "Lesson Two")] {
        let dir = unit.join(folder);
        assert!(dir.is_dir(), "missing folder {}", dir.display());
        assert!(dir.join(format!("{title}.html")).exists());
        assert!(dir.join(format!("{title}.png")).exists());
        assert!(dir.join(format!("{title}.pdf")).exists());
    }

    // Persisted state matches memory.
    let store = StateStore::new(project.path());
    let persisted = store.load().unwrap().unwrap();
    assert!(persisted.queue.is_empty());
    assert_eq!(persisted.visited, expected);
}

#[tokio::test]
async fn second_run_with_finished_state_fetches_nothing() {
    let project = TempDir::new().unwrap();
    let factory = ScriptedFactory::with_pages(simple_module_pages());
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let mut state = CrawlState::seeded(VecDeque::from([url("lesson/one")]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    // Simulate a restart: reload persisted state into a fresh crawler.
    let store = StateStore::new(project.path());
    let mut reloaded = store.load().unwrap().unwrap();

    let factory = ScriptedFactory::with_pages(simple_module_pages());
    let (fetch_log, sessions) = factory.handle();
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();
    crawler.run_pass(&mut reloaded).await.unwrap();

    assert!(fetch_log.lock().unwrap().is_empty(), "no page refetched");
    assert_eq!(sessions.load(Ordering::SeqCst), 0, "no session created");
    assert_eq!(reloaded.visited.len(), 3);
}

#[tokio::test]
async fn ordinal_numbering_survives_restart_with_visited_middle_lesson() {
    let project = TempDir::new().unwrap();
    let entry = url("m/a");
    let lesson_b = url("m/b");
    let lesson_c = url("m/c");
    let siblings = [entry.as_str(), lesson_b.as_str(), lesson_c.as_str()];

    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html("Unit 2", "Lesson A", &siblings, None, &[], None),
    );
    pages.insert(
        lesson_b.clone(),
        lesson_html("Unit 2", "Lesson B", &siblings, None, &[], None),
    );
    pages.insert(
        lesson_c.clone(),
        lesson_html("Unit 2", "Lesson C", &siblings, None, &[], None),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let (fetch_log, _) = factory.handle();
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    // Crash happened after B was visited: B is in the set, the module is not
    // committed yet.
    let mut state = CrawlState::seeded(VecDeque::from([entry.clone()]), ROOT);
    state.visited.insert(lesson_b.clone());
    crawler.run_pass(&mut state).await.unwrap();

    let unit = project.path().join("English Course").join("Unit 2");
    assert!(unit.join("1. Lesson A").is_dir());
    assert!(unit.join("3. Lesson C").is_dir(), "C keeps ordinal 3");
    assert!(!unit.join("2. Lesson C").exists());
    assert!(!unit.join("2. Lesson B").exists(), "B was never refetched");
    assert!(!fetch_log.lock().unwrap().contains(&lesson_b));
}

#[tokio::test]
async fn module_fetch_failure_aborts_pass_without_corrupting_state() {
    let project = TempDir::new().unwrap();
    let good = url("mod1/entry");
    let bad = url("mod2/entry");

    let mut pages = simple_module_pages();
    pages.insert(
        good.clone(),
        lesson_html("Unit 3", "Solo", &[&good], None, &[], None),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let fail_always: HashSet<String> = [bad.clone()].into_iter().collect();
    let factory = ScriptedFactory {
        fail_always: Arc::new(fail_always),
        ..factory
    };
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let mut state = CrawlState::seeded(VecDeque::from([good.clone(), bad.clone()]), ROOT);
    let result = crawler.run_pass(&mut state).await;
    assert!(result.is_err(), "unfetchable module entry aborts the pass");

    // Module 1 committed; module 2 still queued, nothing lost.
    assert_eq!(state.queue, VecDeque::from([bad.clone()]));
    assert!(state.visited.contains(&good));

    let persisted = StateStore::new(project.path()).load().unwrap().unwrap();
    assert_eq!(persisted.queue, VecDeque::from([bad]));
    assert!(persisted.visited.contains(&good));
}

#[tokio::test]
async fn lesson_fetch_failure_skips_lesson_but_commits_module() {
    let project = TempDir::new().unwrap();
    let entry = url("u4/a");
    let flaky = url("u4/b");
    let last = url("u4/c");
    let siblings = [entry.as_str(), flaky.as_str(), last.as_str()];

    let mut pages = HashMap::new();
    for (page_url, title) in [(&entry, "Alpha"), (&flaky, "Beta"), (&last, "Gamma")] {
        pages.insert(
            page_url.clone(),
            lesson_html("Unit 4", title, &siblings, None, &[], None),
        );
    }

    let factory = ScriptedFactory::with_pages(pages);
    let fail_always: HashSet<String> = [flaky.clone()].into_iter().collect();
    let factory = ScriptedFactory {
        fail_always: Arc::new(fail_always),
        ..factory
    };
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let mut state = CrawlState::seeded(VecDeque::from([entry.clone()]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    // The flaky lesson is left unvisited; its slot in the numbering is kept.
    assert!(!state.visited.contains(&flaky));
    assert!(state.visited.contains(&last));
    assert!(state.queue.is_empty());

    let unit = project.path().join("English Course").join("Unit 4");
    assert!(unit.join("1. Alpha").is_dir());
    assert!(!unit.join("2. Beta").exists());
    assert!(unit.join("3. Gamma").is_dir());
}

#[tokio::test]
async fn module_retry_resaves_entry_page() {
    let project = TempDir::new().unwrap();
    let entry = url("u5/entry");
    let sibling = url("u5/second");
    let siblings = [entry.as_str(), sibling.as_str()];

    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html("Unit 5", "Entry", &siblings, None, &[], None),
    );
    pages.insert(
        sibling.clone(),
        lesson_html("Unit 5", "Second", &siblings, None, &[], None),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let (fetch_log, _) = factory.handle();
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    // Crash mid-module after the sibling was saved: the entry page is
    // deliberately refetched and resaved on re-entry.
    let mut state = CrawlState::seeded(VecDeque::from([entry.clone()]), ROOT);
    state.visited.insert(sibling.clone());
    crawler.run_pass(&mut state).await.unwrap();

    let log = fetch_log.lock().unwrap();
    assert!(log.contains(&entry));
    assert!(!log.contains(&sibling));
    drop(log);

    let entry_dir = project
        .path()
        .join("English Course")
        .join("Unit 5")
        .join("1. Entry");
    assert!(entry_dir.join("Entry.html").exists());
}

#[tokio::test]
async fn supervisor_recovers_after_transient_module_failure() {
    let project = TempDir::new().unwrap();
    let entry = url("lesson/one");

    let factory = ScriptedFactory::with_pages(simple_module_pages());
    factory.fail_once.lock().unwrap().insert(entry.clone());
    let (_, sessions) = factory.handle();
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let supervisor = Supervisor::new(3, Duration::ZERO, Duration::ZERO);
    let mut state = CrawlState::seeded(VecDeque::from([entry]), ROOT);
    supervisor.run(&crawler, &mut state).await.unwrap();

    assert!(state.queue.is_empty());
    assert_eq!(state.visited.len(), 3);
    // One session for the failed pass, one for the successful pass.
    assert_eq!(sessions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn supervisor_surfaces_terminal_failure_after_pass_budget() {
    let project = TempDir::new().unwrap();
    let entry = url("always/broken");

    let factory = ScriptedFactory::with_pages(HashMap::new());
    let fail_always: HashSet<String> = [entry.clone()].into_iter().collect();
    let factory = ScriptedFactory {
        fail_always: Arc::new(fail_always),
        ..factory
    };
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let supervisor = Supervisor::new(2, Duration::ZERO, Duration::ZERO);
    let mut state = CrawlState::seeded(VecDeque::from([entry.clone()]), ROOT);
    let result = supervisor.run(&crawler, &mut state).await;

    match result {
        Err(SupervisorError::PassBudgetExhausted { passes, .. }) => assert_eq!(passes, 2),
        Ok(()) => panic!("deterministic failure must not complete"),
    }
    // State still intact for a later manual rerun.
    assert_eq!(state.queue, VecDeque::from([entry]));
}

#[tokio::test]
async fn attachments_are_saved_with_indexed_names_and_partial_failure_is_kept_local() {
    let server = MockServer::start().await;
    let project = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/files/sheet.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"sheet"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/missing.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let entry = url("u6/files");
    let attachments = [
        ("Exercise sheet", format!("{}/files/sheet.pdf", server.uri())),
        ("Archive", format!("{}/files/missing.zip", server.uri())),
    ];
    let attachment_refs: Vec<(&str, &str)> = attachments
        .iter()
        .map(|(name, url)| (*name, url.as_str()))
        .collect();

    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html("Unit 6", "Files", &[entry.as_str()], None, &attachment_refs, None),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();
    let mut state = CrawlState::seeded(VecDeque::from([entry.clone()]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    let dir = project
        .path()
        .join("English Course")
        .join("Unit 6")
        .join("1. Files");
    assert_eq!(
        std::fs::read(dir.join("0 - Exercise sheet.pdf")).unwrap(),
        b"sheet"
    );
    assert!(!dir.join("1 - Archive.zip").exists());
    // The lesson still completed despite the failed attachment.
    assert!(state.queue.is_empty());
}

#[tokio::test]
async fn existing_video_file_skips_download_entirely() {
    let server = MockServer::start().await;
    let project = TempDir::new().unwrap();

    // The playlist must never be requested.
    Mock::given(method("GET"))
        .and(path("/v/master.m3u8"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let entry = url("u7/video");
    let playlist = format!("{}/v/master.m3u8", server.uri());
    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html(
            "Unit 7",
            "Video Lesson",
            &[entry.as_str()],
            Some(&playlist),
            &[],
            None,
        ),
    );

    // Pre-existing video from an earlier run.
    let dir = project
        .path()
        .join("English Course")
        .join("Unit 7")
        .join("1. Video Lesson");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("Video Lesson.mp4"), b"already here").unwrap();

    let factory = ScriptedFactory::with_pages(pages);
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();
    let mut state = CrawlState::seeded(VecDeque::from([entry]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    assert_eq!(
        std::fs::read(dir.join("Video Lesson.mp4")).unwrap(),
        b"already here"
    );
    server.verify().await;
}

#[tokio::test]
async fn video_is_assembled_from_playlist_when_missing() {
    let server = MockServer::start().await;
    let project = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/seg0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AA"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/seg1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"BB"))
        .mount(&server)
        .await;

    let entry = url("u8/video");
    let playlist = format!("{}/v/index.m3u8", server.uri());
    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html(
            "Unit 8",
            "Clip",
            &[entry.as_str()],
            Some(&playlist),
            &[],
            None,
        ),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();
    let mut state = CrawlState::seeded(VecDeque::from([entry]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    let clip = project
        .path()
        .join("English Course")
        .join("Unit 8")
        .join("1. Clip")
        .join("Clip.mp4");
    assert_eq!(std::fs::read(clip).unwrap(), b"AABB");
}

#[tokio::test]
async fn assessment_page_is_saved_in_subfolder() {
    let project = TempDir::new().unwrap();
    let entry = url("u9/quiz");
    let assessment = url("assessment/99");

    let mut pages = HashMap::new();
    pages.insert(
        entry.clone(),
        lesson_html(
            "Unit 9",
            "Quiz Lesson",
            &[entry.as_str()],
            None,
            &[],
            Some(assessment.as_str()),
        ),
    );
    pages.insert(
        assessment.clone(),
        "<html><body>quiz body</body></html>".to_string(),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();
    let mut state = CrawlState::seeded(VecDeque::from([entry]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    let saved = project
        .path()
        .join("English Course")
        .join("Unit 9")
        .join("1. Quiz Lesson")
        .join("assessment")
        .join("assessment_page.html");
    assert_eq!(std::fs::read_to_string(saved).unwrap(), "<html><body>quiz body</body></html>");
}

#[tokio::test]
async fn one_session_per_module_is_created_and_torn_down() {
    let project = TempDir::new().unwrap();
    let first = url("ma/entry");
    let second = url("mb/entry");

    let mut pages = HashMap::new();
    pages.insert(
        first.clone(),
        lesson_html("Unit A", "A", &[first.as_str()], None, &[], None),
    );
    pages.insert(
        second.clone(),
        lesson_html("Unit B", "B", &[second.as_str()], None, &[], None),
    );

    let factory = ScriptedFactory::with_pages(pages);
    let (_, sessions) = factory.handle();
    let crawler = Crawler::new(test_config(&project), Box::new(factory)).unwrap();

    let mut state = CrawlState::seeded(VecDeque::from([first, second]), ROOT);
    crawler.run_pass(&mut state).await.unwrap();

    assert_eq!(sessions.load(Ordering::SeqCst), 2);
}
