/// Change filter: decides whether a raw filesystem event is worth a restart.
///
/// Pure predicate over a path string and an event kind. Lock files,
/// anything below an ignored directory, and files outside the watched
/// extension set never trigger a restart.
use crate::config::WatchConfig;
use glob::Pattern;
use std::collections::HashSet;
use std::path::{Component, Path};

/// Kind of filesystem mutation, reduced to what the filter cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Written,
    Renamed,
    Removed,
    Other,
}

/// Errors building a filter from configuration.
#[derive(Debug)]
pub enum FilterError {
    /// An `ignore_files` entry is not a valid glob pattern.
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Pattern { pattern, source } => {
                write!(f, "invalid ignore pattern {:?}: {}", pattern, source)
            }
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FilterError::Pattern { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFilter {
    extensions: Vec<String>,
    ignore_dirs: HashSet<String>,
    ignore_files: Vec<Pattern>,
}

impl ChangeFilter {
    pub fn new<E, D, F>(extensions: E, ignore_dirs: D, ignore_files: F) -> Result<Self, FilterError>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
        F: IntoIterator,
        F::Item: AsRef<str>,
    {
        let ignore_files = ignore_files
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|e| FilterError::Pattern {
                    pattern: p.to_string(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            ignore_dirs: ignore_dirs.into_iter().map(Into::into).collect(),
            ignore_files,
        })
    }

    pub fn from_config(config: &WatchConfig) -> Result<Self, FilterError> {
        Self::new(
            config.extensions.iter().cloned(),
            config.ignore_dirs.iter().cloned(),
            &config.ignore_files,
        )
    }

    /// True if a directory with this exact name must not be watched.
    pub fn is_ignored_dir(&self, name: &str) -> bool {
        self.ignore_dirs.contains(name)
    }

    /// True if the final path segment matches an ignore-file pattern.
    pub fn is_ignored_file(&self, name: &str) -> bool {
        self.ignore_files.iter().any(|p| p.matches(name))
    }

    /// Decide whether `path` changing with `kind` should restart the command.
    ///
    /// Only writes and creations count. Renames and removals are dropped so
    /// editors that save via rename-replace do not fire twice.
    pub fn is_restart_worthy(&self, path: &str, kind: ChangeKind) -> bool {
        if !matches!(kind, ChangeKind::Written | ChangeKind::Created) {
            return false;
        }

        let segments: Vec<&str> = Path::new(path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        let Some((file_name, parents)) = segments.split_last() else {
            return false;
        };

        if self.is_ignored_file(file_name) {
            return false;
        }

        if parents.iter().any(|dir| self.is_ignored_dir(dir)) {
            return false;
        }

        self.extensions.iter().any(|ext| file_name.ends_with(ext.as_str()))
    }
}
