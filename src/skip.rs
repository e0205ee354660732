//! Providers for the set of event identifiers hidden from the window.
//!
//! A provider returns `Result`; the refresh loop treats an `Err` as
//! "nothing skipped" and logs it, so a broken skip list can never empty
//! the window.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkipError {
    #[error("Failed to read skip list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Skip provider unavailable: {0}")]
    Unavailable(String),
}

pub trait SkipProvider: Send + Sync {
    fn skipped_ids(&self) -> Result<HashSet<String>, SkipError>;
}

/// Fixed list, typically from `skip_ids` in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticSkipList {
    ids: HashSet<String>,
}

impl StaticSkipList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl SkipProvider for StaticSkipList {
    fn skipped_ids(&self) -> Result<HashSet<String>, SkipError> {
        Ok(self.ids.clone())
    }
}

/// Newline-delimited identifiers read from disk on every call, so edits
/// take effect on the next cycle. `#` starts a comment; a missing file is
/// an empty list.
#[derive(Debug, Clone)]
pub struct FileSkipList {
    path: PathBuf,
}

impl FileSkipList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SkipProvider for FileSkipList {
    fn skipped_ids(&self) -> Result<HashSet<String>, SkipError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(source) => {
                return Err(SkipError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        Ok(content
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Union of several providers. One failing provider does not hide the
/// others' identifiers.
#[derive(Default)]
pub struct CombinedSkipList {
    providers: Vec<Box<dyn SkipProvider>>,
}

impl CombinedSkipList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl SkipProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl SkipProvider for CombinedSkipList {
    fn skipped_ids(&self) -> Result<HashSet<String>, SkipError> {
        let mut ids = HashSet::new();
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.skipped_ids() {
                Ok(set) => ids.extend(set),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if !failures.is_empty() && ids.is_empty() {
            return Err(SkipError::Unavailable(failures.join("; ")));
        }
        for failure in failures {
            tracing::warn!(error = %failure, "Skip provider failed, using remaining providers");
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl SkipProvider for Broken {
        fn skipped_ids(&self) -> Result<HashSet<String>, SkipError> {
            Err(SkipError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_static_list() {
        let list = StaticSkipList::new(["a", "b"]);
        let ids = list.skipped_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("a"));
    }

    #[test]
    fn test_file_list_parses_comments_and_blanks() {
        let dir = std::env::temp_dir().join("calwindow_skip_test_parse");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("skip.txt");
        std::fs::write(&path, "# hidden events\nuid-1\n\n  uid-2  # lunch\n").unwrap();

        let ids = FileSkipList::new(&path).skipped_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("uid-1"));
        assert!(ids.contains("uid-2"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_list_missing_is_empty() {
        let list = FileSkipList::new("/tmp/calwindow_skip_test_missing/skip.txt");
        assert!(list.skipped_ids().unwrap().is_empty());
    }

    #[test]
    fn test_file_list_unreadable_is_error() {
        // A directory cannot be read as a file
        let dir = std::env::temp_dir().join("calwindow_skip_test_dir");
        std::fs::create_dir_all(&dir).unwrap();

        let result = FileSkipList::new(&dir).skipped_ids();
        assert!(matches!(result, Err(SkipError::Io { .. })));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_combined_keeps_working_providers() {
        let combined = CombinedSkipList::new()
            .with(Broken)
            .with(StaticSkipList::new(["x"]));
        let ids = combined.skipped_ids().unwrap();
        assert!(ids.contains("x"));
    }

    #[test]
    fn test_combined_all_broken_is_error() {
        let combined = CombinedSkipList::new().with(Broken);
        assert!(combined.skipped_ids().is_err());
    }
}
