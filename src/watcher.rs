/// Watch source: turns notify events under a project root into restart-worthy
/// [`ChangeEvent`]s.
///
/// Directories are registered one by one (non-recursive) during an initial
/// walk that skips ignored subtrees entirely, so dependency trees never cost
/// a watch. Directories created later are registered as they appear.
use crate::filter::{ChangeFilter, ChangeKind};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// A single restart-worthy filesystem mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

/// What the watch source delivers: a change, or a fatal failure after which
/// the sequence ends.
pub type WatchEvent = Result<ChangeEvent, WatchError>;

/// Errors produced by the watch source.
#[derive(Debug)]
pub enum WatchError {
    /// The root directory cannot be read.
    Root {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The root exists but is not a directory.
    NotADirectory { path: PathBuf },
    /// The platform watcher could not be created.
    Init { source: notify::Error },
    /// A directory could not be registered.
    Register {
        path: PathBuf,
        source: notify::Error,
    },
    /// Walking the tree failed at the root.
    Walk { source: walkdir::Error },
    /// The root directory was deleted while being watched.
    RootRemoved { path: PathBuf },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Root { path, source } => {
                write!(f, "cannot read watch root {}: {}", path.display(), source)
            }
            WatchError::NotADirectory { path } => {
                write!(f, "watch root {} is not a directory", path.display())
            }
            WatchError::Init { source } => {
                write!(f, "failed to create file watcher: {}", source)
            }
            WatchError::Register { path, source } => {
                write!(f, "failed to watch {}: {}", path.display(), source)
            }
            WatchError::Walk { source } => {
                write!(f, "failed to walk watch root: {}", source)
            }
            WatchError::RootRemoved { path } => {
                write!(f, "watch root {} was removed", path.display())
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Root { source, .. } => Some(source),
            WatchError::Init { source } => Some(source),
            WatchError::Register { source, .. } => Some(source),
            WatchError::Walk { source } => Some(source),
            WatchError::NotADirectory { .. } | WatchError::RootRemoved { .. } => None,
        }
    }
}

/// Handle to a running watch source. Dropping it (or calling [`close`])
/// stops the background task, which ends the event sequence.
///
/// [`close`]: WatchSource::close
pub struct WatchSource {
    root: PathBuf,
    watched: Vec<PathBuf>,
    cancel: CancellationToken,
}

impl WatchSource {
    /// Register `root` and its non-ignored subdirectories, then start
    /// delivering filtered events on the returned receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        root: &Path,
        filter: ChangeFilter,
        buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>), WatchError> {
        let root = root.canonicalize().map_err(|e| WatchError::Root {
            path: root.to_path_buf(),
            source: e,
        })?;
        if !root.is_dir() {
            return Err(WatchError::NotADirectory { path: root });
        }

        let buffer = buffer.max(1);
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>(buffer);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Runs on notify's own thread, never inside the runtime
            let _ = raw_tx.blocking_send(res);
        })
        .map_err(|e| WatchError::Init { source: e })?;

        let watched = register_tree(&mut watcher, &root, &filter, true)?.dirs;
        tracing::info!(
            root = %root.display(),
            directories = watched.len(),
            "watching for changes"
        );

        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        let task = WatchTask {
            root: root.clone(),
            filter,
            watcher,
            tx,
        };
        tokio::spawn(task.run(raw_rx, cancel.clone()));

        Ok((
            Self {
                root,
                watched,
                cancel,
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories registered by the initial walk.
    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatchSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchTask {
    root: PathBuf,
    filter: ChangeFilter,
    watcher: RecommendedWatcher,
    tx: mpsc::Sender<WatchEvent>,
}

impl WatchTask {
    async fn run(
        mut self,
        mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = raw_rx.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let event = match raw {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "watcher error");
                    continue;
                }
            };

            if matches!(event.kind, EventKind::Remove(_))
                && (event.paths.contains(&self.root) || !self.root.exists())
            {
                let removed = WatchError::RootRemoved {
                    path: self.root.clone(),
                };
                self.emit(Err(removed), &cancel).await;
                break;
            }

            let kind = classify(&event.kind);
            for path in &event.paths {
                if kind == ChangeKind::Created && path.is_dir() {
                    // Files may land before the new directory is registered
                    for file in self.register_new_dir(path) {
                        if !self.emit_if_worthy(&file, ChangeKind::Created, &cancel).await {
                            return;
                        }
                    }
                    continue;
                }
                if !self.emit_if_worthy(path, kind, &cancel).await {
                    return;
                }
            }
        }
        tracing::debug!("watch source stopped");
    }

    /// Filter on the path below the root, so ignored names above the project
    /// never count. Returns false once nobody is listening.
    async fn emit_if_worthy(
        &self,
        path: &Path,
        kind: ChangeKind,
        cancel: &CancellationToken,
    ) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if !self
            .filter
            .is_restart_worthy(&relative.to_string_lossy(), kind)
        {
            tracing::trace!(path = %path.display(), ?kind, "change filtered out");
            return true;
        }
        tracing::debug!(path = %path.display(), ?kind, "restart-worthy change");
        let change = ChangeEvent {
            path: path.to_path_buf(),
        };
        self.emit(Ok(change), cancel).await
    }

    async fn emit(&self, event: WatchEvent, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Register a directory created after startup. Returns the files already
    /// inside it.
    fn register_new_dir(&mut self, path: &Path) -> Vec<PathBuf> {
        let ignored = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.filter.is_ignored_dir(n))
            .unwrap_or(false);
        if ignored {
            tracing::debug!(path = %path.display(), "skipping new ignored directory");
            return Vec::new();
        }
        match register_tree(&mut self.watcher, path, &self.filter, false) {
            Ok(tree) => {
                tracing::debug!(
                    path = %path.display(),
                    directories = tree.dirs.len(),
                    files = tree.files.len(),
                    "registered new directory"
                );
                tree.files
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to watch new directory");
                Vec::new()
            }
        }
    }
}

/// What a walk registered, plus the files it passed on the way.
struct WatchedTree {
    dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

/// Walk `root`, registering every directory that is not inside an ignored
/// subtree. Errors below the root are logged and skipped; at the root they
/// are returned when `strict` is set.
fn register_tree(
    watcher: &mut RecommendedWatcher,
    root: &Path,
    filter: &ChangeFilter,
    strict: bool,
) -> Result<WatchedTree, WatchError> {
    let mut tree = WatchedTree {
        dirs: Vec::new(),
        files: Vec::new(),
    };
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry.file_type().is_dir()
            || !entry
                .file_name()
                .to_str()
                .map(|name| filter.is_ignored_dir(name))
                .unwrap_or(false)
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 && strict => return Err(WatchError::Walk { source: e }),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            tree.files.push(entry.into_path());
            continue;
        }
        let path = entry.path();
        match watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => tree.dirs.push(path.to_path_buf()),
            Err(e) if entry.depth() == 0 && strict => {
                return Err(WatchError::Register {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to watch directory");
            }
        }
    }
    Ok(tree)
}

fn classify(kind: &EventKind) -> ChangeKind {
    match kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            ChangeKind::Written
        }
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => ChangeKind::Other,
    }
}
