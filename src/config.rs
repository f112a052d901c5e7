use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

/// Name of the archive directory inside the application home.
pub const ARCHIVE_DIRECTORY: &str = "pairsync.archive";

/// How long a remote probe may take before it counts as a transient failure.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// The configuration for the state engine.
#[derive(Debug)]
pub struct Config {
    pub ignore: Ignore,
    pub folderish_policy: FolderishPolicy,
    pub remote_timeout: Duration,
}

#[derive(Debug)]
/// Determines which local entries are skipped when scanning a root.
pub struct Ignore {
    pub regexes: Vec<Regex>,
    /// Root-relative POSIX path prefixes, e.g. `/.git`.
    pub paths: Vec<String>,
}

impl Ignore {
    /// An `Ignore` struct that ignores nothing
    pub fn nothing() -> Self {
        Ignore {
            regexes: Vec::new(),
            paths: Vec::new(),
        }
    }
}

/// What to do when the local and remote sides disagree on whether an entry
/// is a folder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderishPolicy {
    /// Keep the summary derived from the micro-states alone.
    Ignore,
    /// Report the pair as conflicted.
    Conflict,
}

impl Default for FolderishPolicy {
    fn default() -> Self {
        FolderishPolicy::Ignore
    }
}

impl Config {
    pub fn new() -> Self {
        Config {
            ignore: Ignore::nothing(),
            folderish_policy: FolderishPolicy::default(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    pub fn with_ignore(mut self, ignore: Ignore) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_folderish_policy(mut self, policy: FolderishPolicy) -> Self {
        self.folderish_policy = policy;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Where the archive lives for a given application home directory.
    pub fn archive_directory(home: &Path) -> PathBuf {
        home.join(ARCHIVE_DIRECTORY)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
