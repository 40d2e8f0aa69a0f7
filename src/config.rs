//! Crawl configuration and the request identity bundle.
//!
//! Credentials (cookies + user agent) come from files exported out-of-band:
//! the cookie file is a browser-export JSON array and the user-agent file is a
//! single line of text. Both are read once at startup into an immutable
//! [`Credentials`] value that is passed down explicitly; nothing in the crate
//! reads them from ambient global state.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Site root. Also the sentinel seeded into the visited set so the traversal
/// never treats the root itself as a lesson.
pub const BASE_URL: &str = "https://cursos.fluencyacademy.io/";

/// Default cookie-export file, read from the working directory.
pub const DEFAULT_COOKIE_FILE: &str = "cookies.json";

/// Default user-agent file, read from the working directory.
pub const DEFAULT_USER_AGENT_FILE: &str = "user_agent.txt";

/// Navigation sections that share the lesson-page structure this tool mirrors.
/// The course portal localizes section names per market, so the list carries
/// every spelling seen in the wild.
pub const MODULES_TO_CRAWL: &[&str] = &[
    "Bem-Vindo",
    "Bem-vindo",
    "Welcome",
    "Benvenuti",
    "¡Bienvenido!",
    "Bienvenue",
    "Minicurso",
    "Wave 01",
    "Wave 02",
    "Onda 1",
    "Onda 2",
    "Onda 01",
    "Onda 02",
    "Morceau 01",
    "Morceau 02",
    "파도 2",
    "Extra",
    "Extras",
];

/// Errors raised while assembling the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The cookie file could not be read.
    #[error("failed to read cookie file {path}: {source}")]
    CookieFile {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The cookie file is not a JSON array of cookie objects.
    #[error("cookie file {path} is not a browser cookie export: {source}")]
    CookieFormat {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The cookie file parsed but contained no usable cookies.
    #[error("cookie file {path} contains no cookies with a name and value")]
    NoCookies {
        /// Path that was attempted.
        path: PathBuf,
    },

    /// The user-agent file could not be read.
    #[error("failed to read user-agent file {path}: {source}")]
    UserAgentFile {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// One cookie from a browser JSON export.
///
/// Only `name` and `value` are required; the remaining fields are forwarded to
/// the browser session when present so injected cookies scope correctly.
#[derive(Clone, Deserialize)]
pub struct CookieEntry {
    /// Cookie name.
    pub name: String,
    /// Cookie value (sensitive — never log).
    value: String,
    /// Domain the cookie belongs to.
    #[serde(default)]
    pub domain: Option<String>,
    /// URL path scope.
    #[serde(default)]
    pub path: Option<String>,
    /// HTTPS-only flag.
    #[serde(default)]
    pub secure: Option<bool>,
}

impl CookieEntry {
    /// Returns the cookie value.
    ///
    /// Cookie values are sensitive — avoid logging the return value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

// Custom Debug impl that redacts the cookie value.
impl fmt::Debug for CookieEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieEntry")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .finish()
    }
}

/// The fixed request identity attached to every HTTP request and browser
/// session for the whole crawl.
#[derive(Debug, Clone)]
pub struct Credentials {
    cookies: Vec<CookieEntry>,
    user_agent: String,
}

impl Credentials {
    /// Loads the identity bundle from a cookie-export JSON file and a
    /// user-agent text file.
    ///
    /// Cookies without both a name and a value are dropped with a warning
    /// rather than failing the whole file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when either file is unreadable, the cookie file
    /// is not valid JSON, or no usable cookie remains after filtering.
    pub fn load(cookie_file: &Path, user_agent_file: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(cookie_file).map_err(|source| ConfigError::CookieFile {
            path: cookie_file.to_path_buf(),
            source,
        })?;
        let parsed: Vec<CookieEntry> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::CookieFormat {
                path: cookie_file.to_path_buf(),
                source,
            })?;

        let cookies: Vec<CookieEntry> = parsed
            .into_iter()
            .filter(|cookie| {
                let usable = !cookie.name.is_empty() && !cookie.value.is_empty();
                if !usable {
                    tracing::warn!(name = %cookie.name, "dropping cookie without name/value");
                }
                usable
            })
            .collect();
        if cookies.is_empty() {
            return Err(ConfigError::NoCookies {
                path: cookie_file.to_path_buf(),
            });
        }

        let user_agent = fs::read_to_string(user_agent_file)
            .map_err(|source| ConfigError::UserAgentFile {
                path: user_agent_file.to_path_buf(),
                source,
            })?
            .trim()
            .to_string();

        Ok(Self {
            cookies,
            user_agent,
        })
    }

    /// Builds a bundle directly from parts.
    #[must_use]
    pub fn new(cookies: Vec<CookieEntry>, user_agent: String) -> Self {
        Self {
            cookies,
            user_agent,
        }
    }

    /// Value for the `Cookie` request header: `name=value` pairs joined with
    /// `"; "`, in file order.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The cookie entries, for session-level injection.
    #[must_use]
    pub fn cookies(&self) -> &[CookieEntry] {
        &self.cookies
    }

    /// The user-agent string sent with every request.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Everything the crawl needs, constructed once in `main`.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Output folder the mirror is written into.
    pub project_dir: PathBuf,
    /// Site root; lesson links are joined against this.
    pub base_url: String,
    /// Request identity for every fetch.
    pub credentials: Credentials,
}

impl CrawlConfig {
    /// Builds a config with the default site root.
    #[must_use]
    pub fn new(project_dir: PathBuf, credentials: Credentials) -> Self {
        Self {
            project_dir,
            base_url: BASE_URL.to_string(),
            credentials,
        }
    }
}
