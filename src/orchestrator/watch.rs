//! Hot reload for local plugin roots.
//!
//! ```text
//! watcher task:  notify event
//!                  → map to the deepest watched root
//!                  → debounce per root
//!                  → blake3 tree hash, compare with the last one
//!                  → enqueue root
//! reload task:   Orchestrator::revalidate(root) → ReloadEvent
//! ```
//!
//! The watcher never touches the registry; every write goes through
//! [`Orchestrator::revalidate`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CandidateFailure, Orchestrator};
use crate::registry::RegisterOutcome;
use crate::security::{IGNORED_DIRS, tree_hash};

const EVENT_BUFFER: usize = 64;

#[derive(Debug)]
pub enum ReloadEvent {
    Reloaded {
        root: PathBuf,
        name: Option<String>,
        outcome: RegisterOutcome,
    },
    /// The previous registry entry, if any, is still in place.
    Failed {
        root: PathBuf,
        failure: CandidateFailure,
    },
    WatcherError(String),
}

#[derive(Debug, Clone)]
struct WatchedRoot {
    root: PathBuf,
    canonical: PathBuf,
}

impl WatchedRoot {
    fn new(root: PathBuf) -> Self {
        let canonical = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self { root, canonical }
    }

    /// Depth of the match when `path` lies under this root.
    fn match_depth(&self, path: &Path) -> Option<usize> {
        [&self.root, &self.canonical]
            .into_iter()
            .filter(|root| path.starts_with(root))
            .map(|root| root.components().count())
            .max()
    }
}

/// Running hot reload. Both tasks stop when the cancellation token passed to
/// [`Orchestrator::spawn_hot_reload`] fires, on [`shutdown`](Self::shutdown),
/// or once the handle is dropped and the next event finds no receiver.
pub struct HotReloadHandle {
    events: mpsc::Receiver<ReloadEvent>,
    additions: mpsc::UnboundedSender<PathBuf>,
    roots: Arc<RwLock<Vec<WatchedRoot>>>,
    cancel: CancellationToken,
    tasks: [JoinHandle<()>; 2],
}

impl HotReloadHandle {
    pub async fn next_event(&mut self) -> Option<ReloadEvent> {
        self.events.recv().await
    }

    /// Starts watching another plugin root.
    pub fn watch(&self, root: impl Into<PathBuf>) -> bool {
        self.additions.send(root.into()).is_ok()
    }

    pub async fn watched_roots(&self) -> Vec<PathBuf> {
        self.roots.read().await.iter().map(|r| r.root.clone()).collect()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Hot reload task failed");
            }
        }
    }
}

struct WatchLoop {
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    additions: mpsc::UnboundedReceiver<PathBuf>,
    changed: mpsc::UnboundedSender<PathBuf>,
    events: mpsc::Sender<ReloadEvent>,
    roots: Arc<RwLock<Vec<WatchedRoot>>>,
    hashes: HashMap<PathBuf, String>,
    debounce: Duration,
}

impl Orchestrator {
    /// Watches every registered local plugin root and revalidates a root
    /// once its content changes.
    pub async fn spawn_hot_reload(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> crate::Result<HotReloadHandle> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;

        let initial: Vec<PathBuf> = self
            .registry()
            .snapshot()
            .await
            .entries()
            .filter(|e| e.origin.is_local())
            .map(|e| e.root_path.clone())
            .collect();

        let mut roots = Vec::new();
        let mut hashes = HashMap::new();
        for root in initial {
            if let Some((watched, hash)) = start_watching(&mut watcher, root).await {
                hashes.insert(watched.root.clone(), hash);
                roots.push(watched);
            }
        }
        info!(roots = roots.len(), "Hot reload started");

        let roots = Arc::new(RwLock::new(roots));
        let cancel = cancel.child_token();
        let watch = WatchLoop {
            watcher,
            raw_rx,
            additions: add_rx,
            changed: changed_tx,
            events: event_tx.clone(),
            roots: Arc::clone(&roots),
            hashes,
            debounce: self.config().debounce(),
        };
        let tasks = [
            tokio::spawn(watch.run(cancel.clone())),
            tokio::spawn(reload_changed(
                Arc::clone(self),
                changed_rx,
                event_tx,
                cancel.clone(),
            )),
        ];

        Ok(HotReloadHandle {
            events: event_rx,
            additions: add_tx,
            roots,
            cancel,
            tasks,
        })
    }
}

async fn start_watching(
    watcher: &mut RecommendedWatcher,
    root: PathBuf,
) -> Option<(WatchedRoot, String)> {
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        warn!(root = %root.display(), error = %e, "Failed to watch plugin root");
        return None;
    }
    let hash = hash_root(&root).await.unwrap_or_default();
    debug!(root = %root.display(), "Watching plugin root");
    Some((WatchedRoot::new(root), hash))
}

async fn hash_root(root: &Path) -> Option<String> {
    let dir = root.to_path_buf();
    match tokio::task::spawn_blocking(move || tree_hash(&dir)).await {
        Ok(Ok(hash)) => Some(hash),
        Ok(Err(e)) => {
            debug!(root = %root.display(), error = %e, "Failed to hash plugin root");
            None
        }
        Err(e) => {
            warn!(error = %e, "Hash task failed");
            None
        }
    }
}

fn is_ignored(path: &Path) -> bool {
    path.components()
        .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
}

impl WatchLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

        loop {
            let next_deadline = pending.values().copied().min();

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("Hot reload cancelled");
                    break;
                }

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(root, _)| root.clone())
                        .collect();
                    for root in ready {
                        pending.remove(&root);
                        if !self.process_change(&root).await {
                            return;
                        }
                    }
                }

                Some(root) = self.additions.recv() => {
                    self.add_root(root).await;
                }

                event = self.raw_rx.recv() => match event {
                    Some(Ok(event)) => self.handle_raw_event(&event, &mut pending).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Filesystem watcher error");
                        if self.events.send(ReloadEvent::WatcherError(e.to_string())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn add_root(&mut self, root: PathBuf) {
        if self.roots.read().await.iter().any(|r| r.root == root) {
            return;
        }
        if let Some((watched, hash)) = start_watching(&mut self.watcher, root).await {
            self.hashes.insert(watched.root.clone(), hash);
            self.roots.write().await.push(watched);
        }
    }

    async fn handle_raw_event(&self, event: &Event, pending: &mut HashMap<PathBuf, Instant>) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        let roots = self.roots.read().await;
        for path in event.paths.iter().filter(|p| !is_ignored(p)) {
            let Some(watched) = roots
                .iter()
                .filter_map(|r| r.match_depth(path).map(|depth| (depth, r)))
                .max_by_key(|(depth, _)| *depth)
                .map(|(_, r)| r)
            else {
                continue;
            };
            debug!(path = %path.display(), root = %watched.root.display(), "Plugin file changed");
            pending.insert(watched.root.clone(), Instant::now() + self.debounce);
        }
    }

    /// Returns false once the reload task is gone.
    async fn process_change(&mut self, root: &Path) -> bool {
        let Some(hash) = hash_root(root).await else {
            return true;
        };
        if self.hashes.get(root).is_some_and(|h| *h == hash) {
            debug!(root = %root.display(), "Plugin content unchanged");
            return true;
        }
        debug!(root = %root.display(), %hash, "Plugin content changed");
        self.hashes.insert(root.to_path_buf(), hash);
        self.changed.send(root.to_path_buf()).is_ok()
    }
}

/// Consumes changed roots one at a time.
async fn reload_changed(
    orchestrator: Arc<Orchestrator>,
    mut changed: mpsc::UnboundedReceiver<PathBuf>,
    events: mpsc::Sender<ReloadEvent>,
    cancel: CancellationToken,
) {
    loop {
        let root = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            root = changed.recv() => match root {
                Some(root) => root,
                None => break,
            },
        };

        let event = match orchestrator.revalidate(&root).await {
            Ok(outcome) => {
                let name = orchestrator
                    .registry()
                    .snapshot()
                    .await
                    .find_by_root(&root)
                    .map(|e| e.name().to_string());
                info!(root = %root.display(), plugin = ?name, %outcome, "Plugin reloaded");
                ReloadEvent::Reloaded {
                    root,
                    name,
                    outcome,
                }
            }
            Err(failure) => {
                warn!(root = %root.display(), %failure, "Plugin reload failed");
                ReloadEvent::Failed { root, failure }
            }
        };
        if events.send(event).await.is_err() {
            debug!("Reload event receiver dropped");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_depth_prefers_deepest_root() {
        let outer = WatchedRoot {
            root: PathBuf::from("/plugins"),
            canonical: PathBuf::from("/plugins"),
        };
        let inner = WatchedRoot {
            root: PathBuf::from("/plugins/a"),
            canonical: PathBuf::from("/plugins/a"),
        };
        let path = Path::new("/plugins/a/commands/x.md");
        assert_eq!(outer.match_depth(path), Some(2));
        assert_eq!(inner.match_depth(path), Some(3));
        assert_eq!(inner.match_depth(Path::new("/plugins/b/x.md")), None);
    }

    #[test]
    fn test_ignored_paths() {
        assert!(is_ignored(Path::new("/p/a/node_modules/x/index.js")));
        assert!(is_ignored(Path::new("/p/a/.git/HEAD")));
        assert!(!is_ignored(Path::new("/p/a/commands/x.md")));
    }
}
