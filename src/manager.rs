use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::{Mutex, Notify, RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RootConfig, ServiceConfig};
use crate::error::{Result, WatchError};
use crate::query::{self, Listing, QueryFilter};
use crate::reconciler::{Reconciler, ReconcilerState};
use crate::settle::CookieJar;
use crate::tree::TreeIndex;
use crate::walker::PathFilter;
use crate::watcher::event::ChangeKind;
use crate::watcher::{self, EventSink, WatcherHandle};

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// Returned by `watch`: the canonical root and whether this call started watching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootHandle {
    pub root: PathBuf,
    pub newly_watched: bool,
}

/// Point-in-time view of a watched root.
#[derive(Debug, Clone)]
pub struct RootStatus {
    pub root: PathBuf,
    pub state: ReconcilerState,
    pub entries: usize,
    /// Sequence number of the last event applied to the tree.
    pub last_seq: u64,
    pub recrawls: u64,
    pub created_at: SystemTime,
}

// ---------------------------------------------------------------------------
// WatchedRoot
// ---------------------------------------------------------------------------

/// Everything that must stop when the root is removed.
struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    watcher: WatcherHandle,
}

struct WatchedRoot {
    path: PathBuf,
    created_at: SystemTime,
    active: AtomicBool,
    filter: Arc<PathFilter>,
    tree: Arc<RwLock<TreeIndex>>,
    cookies: Arc<CookieJar>,
    state: watch::Receiver<ReconcilerState>,
    recrawls: Arc<AtomicU64>,
    sink: EventSink,
    running: Mutex<Option<Running>>,
}

impl WatchedRoot {
    fn ensure_active(&self) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WatchError::RootRemoved(self.path.clone()))
        }
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);

        let running = self.running.lock().await.take();
        if let Some(Running {
            shutdown,
            task,
            watcher,
        }) = running
        {
            // Stop the OS subscription first so nothing new is queued.
            drop(watcher);
            let _ = shutdown.send(());
            if let Err(err) = task.await {
                warn!("reconciler for {} ended abnormally: {err}", self.path.display());
            }
        }

        self.cookies.abandon_all().await;
        // The reconciler has exited, so no apply can be in flight.
        self.tree.write().await.clear();
    }
}

// ---------------------------------------------------------------------------
// WatchManager
// ---------------------------------------------------------------------------

/// Owns the set of watched roots and their lifecycle.
///
/// Each root gets its own OS watcher, event queue, reconciler task and tree
/// index; nothing is shared between roots.
pub struct WatchManager {
    config: ServiceConfig,
    roots: RwLock<HashMap<PathBuf, Arc<WatchedRoot>>>,
    /// Roots whose initial crawl is still running. Locked before `roots`.
    starting: Mutex<HashSet<PathBuf>>,
    /// Woken whenever a root leaves `starting`.
    started: Notify,
}

/// Canonical form of a directory we are asked to watch.
fn canonical_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(WatchError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path must be absolute".to_owned(),
        });
    }
    let canonical = path.canonicalize().map_err(|err| WatchError::InvalidPath {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    if !canonical.is_dir() {
        return Err(WatchError::InvalidPath {
            path: path.to_path_buf(),
            reason: "not a directory".to_owned(),
        });
    }
    Ok(canonical)
}

/// Key used to find an already-watched root. The directory may be gone by
/// now, so fall back to the path as given.
fn lookup_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl WatchManager {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            roots: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            started: Notify::new(),
        }
    }

    async fn get(&self, path: &Path) -> Result<Arc<WatchedRoot>> {
        let key = lookup_key(path);
        self.roots
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| WatchError::UnknownRoot(path.to_path_buf()))
    }

    /// Start watching `path`. Idempotent: watching a root twice returns the
    /// existing handle with `newly_watched == false`.
    ///
    /// Returns once the initial crawl is in the index. The OS watcher is armed
    /// before that crawl, so changes made while it runs are queued and applied
    /// right after it.
    pub async fn watch(&self, path: &Path) -> Result<RootHandle> {
        let root = canonical_dir(path)?;

        loop {
            let started = self.started.notified();
            {
                let mut starting = self.starting.lock().await;
                let roots = self.roots.read().await;
                if let Some(existing) = roots.get(&root) {
                    return Ok(RootHandle {
                        root: existing.path.clone(),
                        newly_watched: false,
                    });
                }
                if !starting.contains(&root) {
                    if let Some(existing) = roots
                        .keys()
                        .chain(starting.iter())
                        .find(|existing| root.starts_with(existing) || existing.starts_with(&root))
                    {
                        return Err(WatchError::NestedRoot {
                            path: root.clone(),
                            existing: existing.clone(),
                        });
                    }
                    starting.insert(root.clone());
                    break;
                }
            }
            // Someone else is crawling this root; wait for their outcome.
            started.await;
        }

        let outcome = self.start_root(&root).await;
        {
            let mut starting = self.starting.lock().await;
            if let Ok(watched) = &outcome {
                self.roots
                    .write()
                    .await
                    .insert(root.clone(), Arc::clone(watched));
            }
            starting.remove(&root);
        }
        self.started.notify_waiters();

        outcome?;
        info!("watching {}", root.display());
        Ok(RootHandle {
            root,
            newly_watched: true,
        })
    }

    /// Arm the watcher, prime the index and spawn the reconciler for `root`.
    async fn start_root(&self, root: &Path) -> Result<Arc<WatchedRoot>> {
        let root_config = RootConfig::load(root);
        let filter = Arc::new(PathFilter::new(root, &root_config, &self.config.cookie_prefix));
        let tree = Arc::new(RwLock::new(TreeIndex::new()));
        let cookies = Arc::new(CookieJar::new(&self.config.cookie_prefix));

        let (sink, stream) = watcher::channel(self.config.queue_capacity);
        let handle = watcher::start_watcher((*filter).clone(), sink.clone())?;

        let mut reconciler = Reconciler::new(
            Arc::clone(&filter),
            Arc::clone(&tree),
            Arc::clone(&cookies),
            stream,
        );
        reconciler.prime().await?;

        let state = reconciler.subscribe();
        let recrawls = reconciler.recrawl_counter();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(reconciler.run(shutdown_rx));

        Ok(Arc::new(WatchedRoot {
            path: root.to_path_buf(),
            created_at: SystemTime::now(),
            active: AtomicBool::new(true),
            filter,
            tree,
            cookies,
            state,
            recrawls,
            sink,
            running: Mutex::new(Some(Running {
                shutdown,
                task,
                watcher: handle,
            })),
        }))
    }

    /// Stop watching `path` and release its index. Returns false if it was not watched.
    ///
    /// Queries already past their settle wait finish against the listing they
    /// captured; queries still waiting fail with `RootRemoved`.
    pub async fn watch_del(&self, path: &Path) -> bool {
        let key = lookup_key(path);
        let Some(watched) = self.roots.write().await.remove(&key) else {
            return false;
        };

        watched.stop().await;
        info!("stopped watching {}", watched.path.display());
        true
    }

    pub async fn is_watched(&self, path: &Path) -> bool {
        self.roots.read().await.contains_key(&lookup_key(path))
    }

    /// Watched roots in path order.
    pub async fn watch_list(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.roots.read().await.keys().cloned().collect();
        roots.sort();
        roots
    }

    /// List the live entries of a watched root after waiting for it to settle.
    pub async fn query(&self, path: &Path, filter: &QueryFilter) -> Result<Listing> {
        let watched = self.get(path).await?;
        filter.validate(&watched.path)?;
        watched.ensure_active()?;

        watched
            .cookies
            .sync(&watched.path, self.config.settle_timeout())
            .await?;

        let tree = watched.tree.read().await;
        // watch_del clears the tree under the write lock after deactivating.
        watched.ensure_active()?;
        let listing = query::collect(&tree, &watched.filter, filter);
        debug!(
            "query on {} returned {} entries",
            watched.path.display(),
            listing.len()
        );
        Ok(listing)
    }

    /// `query` restricted to the given relative subtrees; all entries when empty.
    pub async fn find(&self, path: &Path, under: &[PathBuf]) -> Result<Listing> {
        self.query(path, &QueryFilter::under(under.iter().cloned()))
            .await
    }

    pub async fn status(&self, path: &Path) -> Result<RootStatus> {
        let watched = self.get(path).await?;
        let (entries, last_seq) = {
            let tree = watched.tree.read().await;
            (tree.len(), tree.last_seq())
        };
        Ok(RootStatus {
            root: watched.path.clone(),
            state: *watched.state.borrow(),
            entries,
            last_seq,
            recrawls: watched.recrawls.load(Ordering::SeqCst),
            created_at: watched.created_at,
        })
    }

    /// Force the root to throw away its index and recrawl, as if events had been lost.
    pub async fn debug_recrawl(&self, path: &Path) -> Result<()> {
        let watched = self.get(path).await?;
        watched.ensure_active()?;
        if !watched.sink.push(ChangeKind::Overflow) {
            return Err(WatchError::RootRemoved(watched.path.clone()));
        }
        Ok(())
    }

    /// Stop every root.
    pub async fn shutdown(&self) {
        let roots: Vec<Arc<WatchedRoot>> = self.roots.write().await.drain().map(|(_, r)| r).collect();
        for watched in roots {
            watched.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager() -> WatchManager {
        WatchManager::new(ServiceConfig::default())
    }

    fn tmp() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    async fn listing(manager: &WatchManager, root: &Path) -> Vec<String> {
        manager
            .query(root, &QueryFilter::all())
            .await
            .unwrap()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_then_delete_scenario() {
        let (_dir, root) = tmp();
        fs::write(root.join("foo.c"), "").unwrap();
        let manager = manager();
        manager.watch(&root).await.unwrap();

        assert_eq!(listing(&manager, &root).await, vec!["foo.c"]);

        fs::write(root.join("bar.txt"), "").unwrap();
        assert_eq!(listing(&manager, &root).await, vec!["bar.txt", "foo.c"]);

        fs::remove_file(root.join("bar.txt")).unwrap();
        assert_eq!(listing(&manager, &root).await, vec!["foo.c"]);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_touch_delete_touch() {
        let (_dir, root) = tmp();
        let manager = manager();
        manager.watch(&root).await.unwrap();
        let path = root.join("bar.txt");

        fs::write(&path, "").unwrap();
        assert_eq!(listing(&manager, &root).await, vec!["bar.txt"]);
        fs::remove_file(&path).unwrap();
        assert!(listing(&manager, &root).await.is_empty());
        fs::write(&path, "").unwrap();
        assert_eq!(listing(&manager, &root).await, vec!["bar.txt"]);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_renames_move_whole_subtrees() {
        let (_dir, root) = tmp();
        let manager = manager();
        manager.watch(&root).await.unwrap();

        fs::create_dir_all(root.join("adir/subdir")).unwrap();
        fs::write(root.join("adir/subdir/file"), "").unwrap();
        assert_eq!(
            listing(&manager, &root).await,
            vec!["adir", "adir/subdir", "adir/subdir/file"]
        );

        fs::rename(root.join("adir/subdir"), root.join("adir/overhere")).unwrap();
        assert_eq!(
            listing(&manager, &root).await,
            vec!["adir", "adir/overhere", "adir/overhere/file"]
        );

        fs::rename(root.join("adir"), root.join("bdir")).unwrap();
        assert_eq!(
            listing(&manager, &root).await,
            vec!["bdir", "bdir/overhere", "bdir/overhere/file"]
        );

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_is_idempotent() {
        let (_dir, root) = tmp();
        let manager = manager();

        let first = manager.watch(&root).await.unwrap();
        let second = manager.watch(&root).await.unwrap();
        assert!(first.newly_watched);
        assert!(!second.newly_watched);
        assert_eq!(first.root, second.root);
        assert_eq!(manager.status(&root).await.unwrap().entries, 0);
        assert_eq!(manager.watch_list().await, vec![root.clone()]);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_del_stops_answering() {
        let (_dir, root) = tmp();
        let manager = manager();
        manager.watch(&root).await.unwrap();
        assert!(manager.is_watched(&root).await);

        assert!(manager.watch_del(&root).await);
        assert!(!manager.is_watched(&root).await);
        assert!(!manager.watch_del(&root).await);

        let err = manager.query(&root, &QueryFilter::all()).await.unwrap_err();
        assert!(matches!(err, WatchError::UnknownRoot(_)));
    }

    #[tokio::test]
    async fn test_invalid_paths_are_rejected() {
        let (dir, root) = tmp();
        let manager = manager();

        let missing = manager.watch(&root.join("missing")).await.unwrap_err();
        assert!(matches!(missing, WatchError::InvalidPath { .. }));

        fs::write(root.join("file"), "").unwrap();
        let file = manager.watch(&root.join("file")).await.unwrap_err();
        assert!(matches!(file, WatchError::InvalidPath { .. }));

        let relative = manager.watch(Path::new("relative/dir")).await.unwrap_err();
        assert!(matches!(relative, WatchError::InvalidPath { .. }));
        drop(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nested_roots_rejected_both_ways() {
        let (_dir, root) = tmp();
        fs::create_dir_all(root.join("inner")).unwrap();
        let manager = manager();

        manager.watch(&root.join("inner")).await.unwrap();
        let outer = manager.watch(&root).await.unwrap_err();
        assert!(matches!(outer, WatchError::NestedRoot { .. }));

        manager.watch_del(&root.join("inner")).await;
        manager.watch(&root).await.unwrap();
        let inner = manager.watch(&root.join("inner")).await.unwrap_err();
        assert!(matches!(inner, WatchError::NestedRoot { .. }));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_unknown_root() {
        let (_dir, root) = tmp();
        let err = manager()
            .query(&root, &QueryFilter::all())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::UnknownRoot(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ignored_dirs_and_cookies_never_listed() {
        let (_dir, root) = tmp();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join(".git/HEAD"), "").unwrap();
        let manager = manager();
        manager.watch(&root).await.unwrap();

        fs::write(root.join(".git/index"), "").unwrap();
        fs::write(root.join("kept"), "").unwrap();
        for _ in 0..3 {
            assert_eq!(listing(&manager, &root).await, vec!["kept"]);
        }

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debug_recrawl_keeps_listing_correct() {
        let (_dir, root) = tmp();
        fs::write(root.join("foo.c"), "").unwrap();
        let manager = manager();
        manager.watch(&root).await.unwrap();

        manager.debug_recrawl(&root).await.unwrap();
        fs::write(root.join("after"), "").unwrap();
        assert_eq!(listing(&manager, &root).await, vec!["after", "foo.c"]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.status(&root).await.unwrap().recrawls == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recrawl should be counted");

        let status = manager.status(&root).await.unwrap();
        assert_eq!(status.state, ReconcilerState::Live);
        assert_eq!(status.entries, 2);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_overflow_recovers() {
        let (_dir, root) = tmp();
        let config = ServiceConfig {
            queue_capacity: 1,
            ..ServiceConfig::default()
        };
        let manager = WatchManager::new(config);
        manager.watch(&root).await.unwrap();

        for i in 0..200 {
            fs::write(root.join(format!("f{i:03}")), "").unwrap();
        }
        let names = listing(&manager, &root).await;
        assert_eq!(names.len(), 200);
        assert_eq!(names.first().map(String::as_str), Some("f000"));

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_find_under_subtree() {
        let (_dir, root) = tmp();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("src/nested/lib.rs"), "").unwrap();
        fs::write(root.join("README"), "").unwrap();
        let manager = manager();
        manager.watch(&root).await.unwrap();

        let found: Vec<PathBuf> = manager
            .find(&root, &[PathBuf::from("src")])
            .await
            .unwrap()
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("src"),
                PathBuf::from("src/nested"),
                PathBuf::from("src/nested/lib.rs")
            ]
        );

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entries_made_inside_new_directories_are_found() {
        let (_dir, root) = tmp();
        let manager = manager();
        manager.watch(&root).await.unwrap();

        for i in 0..100 {
            let dir = format!("d{i}");
            fs::create_dir(root.join(&dir)).unwrap();
            fs::create_dir(root.join(&dir).join("sub")).unwrap();
            fs::write(root.join(&dir).join("sub/file"), "").unwrap();

            let found: Vec<PathBuf> = manager
                .find(&root, &[PathBuf::from(&dir)])
                .await
                .unwrap()
                .collect();
            assert_eq!(
                found,
                vec![
                    PathBuf::from(&dir),
                    PathBuf::from(&dir).join("sub"),
                    PathBuf::from(&dir).join("sub/file"),
                ],
                "iteration {i}"
            );
        }

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_del_fails_query_waiting_to_settle() {
        let (_dir, root) = tmp();
        fs::write(root.join("foo.c"), "").unwrap();
        let manager = Arc::new(manager());
        manager.watch(&root).await.unwrap();
        let watched = manager.get(&root).await.unwrap();

        // Holding the tree keeps the query from finishing until the root is gone.
        let guard = watched.tree.write().await;
        let query = {
            let manager = Arc::clone(&manager);
            let root = root.clone();
            tokio::spawn(async move { manager.query(&root, &QueryFilter::all()).await })
        };
        while watched.cookies.pending_names().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let removal = {
            let manager = Arc::clone(&manager);
            let root = root.clone();
            tokio::spawn(async move { manager.watch_del(&root).await })
        };
        while watched.active.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(guard);

        let result = tokio::time::timeout(Duration::from_secs(5), query)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WatchError::RootRemoved(_))));
        assert!(removal.await.unwrap());
        assert!(watched.tree.read().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_query_racing_watch_del_never_sees_partial_listing() {
        let (_dir, root) = tmp();
        fs::create_dir(root.join("adir")).unwrap();
        fs::write(root.join("adir/a.c"), "").unwrap();
        fs::write(root.join("foo.c"), "").unwrap();
        let manager = Arc::new(manager());

        for i in 0..20 {
            manager.watch(&root).await.unwrap();
            let query = {
                let manager = Arc::clone(&manager);
                let root = root.clone();
                tokio::spawn(async move { manager.query(&root, &QueryFilter::all()).await })
            };
            if i % 2 == 1 {
                tokio::task::yield_now().await;
            }
            assert!(manager.watch_del(&root).await);

            match query.await.unwrap() {
                Ok(listing) => {
                    let files: Vec<String> =
                        listing.map(|p| p.to_string_lossy().into_owned()).collect();
                    assert_eq!(files, vec!["adir", "adir/a.c", "foo.c"], "iteration {i}");
                }
                Err(WatchError::RootRemoved(_) | WatchError::UnknownRoot(_)) => {}
                Err(err) => panic!("iteration {i}: unexpected error {err}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_starting_root_blocks_only_itself() {
        let (_a, slow) = tmp();
        let (_b, other) = tmp();
        let (_c, fresh) = tmp();
        fs::create_dir(slow.join("inner")).unwrap();
        let manager = Arc::new(manager());
        manager.watch(&other).await.unwrap();

        // Stand in for a root whose initial crawl has not finished.
        manager.starting.lock().await.insert(slow.clone());

        let limit = Duration::from_secs(5);
        assert!(
            tokio::time::timeout(limit, manager.watch_del(&other))
                .await
                .unwrap()
        );
        let handle = tokio::time::timeout(limit, manager.watch(&fresh))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.newly_watched);
        let err = manager.watch(&slow.join("inner")).await.unwrap_err();
        assert!(matches!(err, WatchError::NestedRoot { .. }));

        let waiting = {
            let manager = Arc::clone(&manager);
            let slow = slow.clone();
            tokio::spawn(async move { manager.watch(&slow).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        manager.starting.lock().await.remove(&slow);
        manager.started.notify_waiters();
        let handle = tokio::time::timeout(limit, waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(handle.newly_watched);
        assert_eq!(manager.watch_list().await.len(), 2);

        manager.shutdown().await;
    }
}
