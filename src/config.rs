use std::{
    fmt,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    extract::DEFAULT_EXTRACTION_TIMEOUT,
};

pub const DATA_DIR_ENV: &str = "HELPDEX_DATA_DIR";

/// Where the store lives: `index.redb`, `fulltext/` and, unless configured
/// elsewhere, `metadata/`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The HELPDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/helpdex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("helpdex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_db(&self) -> PathBuf {
        self.root.join("index.redb")
    }

    pub fn fulltext_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("fulltext");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    pub fn default_metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }
}

/// Which release of the documentation the corpus belongs to. Selects the
/// public help site used for online links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DocVersion {
    #[default]
    V4,
    V6,
}

impl DocVersion {
    pub fn number(self) -> u8 {
        match self {
            DocVersion::V4 => 4,
            DocVersion::V6 => 6,
        }
    }

    pub fn base_url(self) -> String {
        format!("https://help.br-automation.com/#/en/{}/", self.number())
    }
}

impl fmt::Display for DocVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl FromStr for DocVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.trim_start_matches('v') {
            "4" => Ok(DocVersion::V4),
            "6" => Ok(DocVersion::V6),
            _ => Err(Error::Config(format!(
                "unsupported documentation version {s:?} (expected 4 or 6)"
            ))),
        }
    }
}

/// Builds the public URL of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFormat {
    base_url: String,
}

impl LinkFormat {
    pub fn new(base_url: &str) -> Self {
        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Link to `href` when the page declares one, else to the source path
    /// with its extension swapped for `.html`.
    pub fn online_url(&self, href: Option<&str>, source_path: &str) -> String {
        let target = match href.map(str::trim).filter(|h| !h.is_empty()) {
            Some(href) => href.trim_start_matches('/').to_string(),
            None => match source_path.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => format!("{stem}.html"),
                _ => format!("{source_path}.html"),
            },
        };
        format!("{}{}", self.base_url, target)
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Everything needed to open and maintain an index.
#[derive(Debug, Clone)]
pub struct Config {
    pub corpus_root: PathBuf,
    pub data_dir: DataDir,
    /// Where the run record (`last_run.json`) is written.
    pub metadata_dir: PathBuf,
    pub doc_version: DocVersion,
    /// Overrides the base URL derived from `doc_version`.
    pub online_base_url: Option<String>,
    pub force_rebuild: bool,
    pub workers: usize,
    pub extraction_timeout: Duration,
}

impl Config {
    pub fn new(corpus_root: impl Into<PathBuf>, data_dir: DataDir) -> Self {
        let metadata_dir = data_dir.default_metadata_dir();
        Self {
            corpus_root: corpus_root.into(),
            data_dir,
            metadata_dir,
            doc_version: DocVersion::default(),
            online_base_url: None,
            force_rebuild: false,
            workers: default_workers(),
            extraction_timeout: DEFAULT_EXTRACTION_TIMEOUT,
        }
    }

    /// Check the configuration before anything touches the store.
    pub fn validate(&self) -> Result<()> {
        if !self.corpus_root.is_dir() {
            return Err(Error::Config(format!(
                "corpus root {} is not a readable directory",
                self.corpus_root.display()
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.extraction_timeout.is_zero() {
            return Err(Error::Config(
                "extraction timeout must be greater than zero".into(),
            ));
        }
        if let Some(url) = &self.online_base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "online base URL {url:?} must start with http:// or https://"
            )));
        }
        Ok(())
    }

    pub fn link_format(&self) -> LinkFormat {
        match &self.online_base_url {
            Some(url) => LinkFormat::new(url),
            None => LinkFormat::new(&self.doc_version.base_url()),
        }
    }
}
