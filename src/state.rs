//! Crash-safe persisted crawl state: the module work queue and visited set.
//!
//! Two records live in the project folder, each a small versioned JSON file.
//! Saves write a temp file in the same directory and atomically rename it over
//! the target, so a crash mid-save always leaves a fully readable prior or new
//! value. Absence of the queue record is how a first run is detected.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name of the persisted work-queue record.
pub const QUEUE_FILE: &str = "modules_queue.json";

/// File name of the persisted visited-links record.
pub const VISITED_FILE: &str = "visited_links.json";

/// Current record schema version. Loading a record with a newer version is an
/// explicit error rather than a silent misparse.
const RECORD_VERSION: u32 = 1;

/// Errors raised by the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Filesystem error reading or writing a record.
    #[error("state file {path}: {source}")]
    Io {
        /// The record path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A record exists but does not parse as its schema.
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        /// The record path involved.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A record was written by a newer version of this tool.
    #[error("state file {path} has unsupported version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// The record path involved.
        path: PathBuf,
        /// Version found in the record.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueRecord {
    version: u32,
    entries: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VisitedRecord {
    version: u32,
    links: Vec<String>,
}

/// In-memory crawl state: FIFO of module entry URLs still to process, and the
/// set of lesson URLs already fully saved.
#[derive(Debug, Clone, Default)]
pub struct CrawlState {
    /// Module entry URLs, front = next to crawl. An entry leaves the queue
    /// only after its whole module is saved.
    pub queue: VecDeque<String>,
    /// Lesson URLs already fully saved. Grows monotonically.
    pub visited: HashSet<String>,
}

impl CrawlState {
    /// Fresh state for a first run: the seeded queue plus a visited set
    /// containing only the site root (sentinel: never crawl the root itself).
    #[must_use]
    pub fn seeded(queue: VecDeque<String>, root_url: &str) -> Self {
        let mut visited = HashSet::new();
        visited.insert(root_url.to_string());
        Self { queue, visited }
    }
}

/// Durable storage for [`CrawlState`] records.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at the given directory (the project folder).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Loads persisted state, or `None` when no queue record exists (first
    /// run). A missing visited record alongside an existing queue record
    /// yields an empty visited set rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] for unreadable, corrupt, or too-new records.
    pub fn load(&self) -> Result<Option<CrawlState>, StateError> {
        let Some(queue) = self.load_queue()? else {
            return Ok(None);
        };
        let visited = self.load_visited()?.unwrap_or_default();
        Ok(Some(CrawlState { queue, visited }))
    }

    /// Loads the work-queue record, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] for unreadable, corrupt, or too-new records.
    pub fn load_queue(&self) -> Result<Option<VecDeque<String>>, StateError> {
        let record: Option<QueueRecord> = self.read_record(QUEUE_FILE)?;
        Ok(record.map(|r| r.entries.into()))
    }

    /// Persists the work-queue record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] when the temp write or rename fails.
    pub fn save_queue(&self, queue: &VecDeque<String>) -> Result<(), StateError> {
        let record = QueueRecord {
            version: RECORD_VERSION,
            entries: queue.iter().cloned().collect(),
        };
        self.write_record(QUEUE_FILE, &record)
    }

    /// Loads the visited-links record, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] for unreadable, corrupt, or too-new records.
    pub fn load_visited(&self) -> Result<Option<HashSet<String>>, StateError> {
        let record: Option<VisitedRecord> = self.read_record(VISITED_FILE)?;
        Ok(record.map(|r| r.links.into_iter().collect()))
    }

    /// Persists the visited-links record. Links are written sorted so
    /// successive saves of the same set produce identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] when the temp write or rename fails.
    pub fn save_visited(&self, visited: &HashSet<String>) -> Result<(), StateError> {
        let mut links: Vec<String> = visited.iter().cloned().collect();
        links.sort();
        let record = VisitedRecord {
            version: RECORD_VERSION,
            links,
        };
        self.write_record(VISITED_FILE, &record)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_record<T>(&self, name: &str) -> Result<Option<T>, StateError>
    where
        T: DeserializeOwned + Versioned,
    {
        let path = self.record_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Io { path, source }),
        };

        let record: T = serde_json::from_str(&raw).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        if record.version() > RECORD_VERSION {
            return Err(StateError::UnsupportedVersion {
                path,
                found: record.version(),
                supported: RECORD_VERSION,
            });
        }
        Ok(Some(record))
    }

    fn write_record<T: Serialize>(&self, name: &str, record: &T) -> Result<(), StateError> {
        let path = self.record_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;
        }

        // Temp file lives in the same directory so the rename stays within one
        // filesystem and is atomic.
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(record).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, payload).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "state record saved");
        Ok(())
    }
}

trait Versioned {
    fn version(&self) -> u32;
}

impl Versioned for QueueRecord {
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for VisitedRecord {
    fn version(&self) -> u32 {
        self.version
    }
}
