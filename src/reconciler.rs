use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, WatchError};
use crate::settle::CookieJar;
use crate::tree::TreeIndex;
use crate::tree::node::EntryKind;
use crate::walker::{self, CrawlEntry, PathFilter};
use crate::watcher::EventStream;
use crate::watcher::event::{ChangeKind, WatchEvent};

/// Upper bound on events applied between two tombstone purges.
const MAX_BATCH: usize = 512;

/// Lifecycle of a root's reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Initial crawl in progress.
    Priming,
    /// Applying events as they arrive.
    Live,
    /// Recovering from lost events with a full recrawl.
    Resyncing,
}

impl ReconcilerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priming => "priming",
            Self::Live => "live",
            Self::Resyncing => "resyncing",
        }
    }
}

/// A directory crawled on creation, before its OS watch was known to be armed.
///
/// The watcher arms watches on new directories only after it has delivered the
/// whole batch of notifications that announced them, so entries created in that
/// window produce no events.
#[derive(Debug)]
struct Unconfirmed {
    path: PathBuf,
    /// `CookieJar::issued` when the directory was crawled. A cookie with a
    /// larger serial was written later and came through a later batch.
    cookie_mark: u64,
}

/// Applies one root's event stream to its tree index, strictly in sequence order.
///
/// The reconciler is the only writer of the tree. Crawls run on the blocking
/// pool without holding the lock; their result is applied under a single
/// write guard so readers never see a half-applied change.
pub struct Reconciler {
    filter: Arc<PathFilter>,
    tree: Arc<RwLock<TreeIndex>>,
    cookies: Arc<CookieJar>,
    stream: EventStream,
    state: watch::Sender<ReconcilerState>,
    recrawls: Arc<AtomicU64>,
    unconfirmed: Vec<Unconfirmed>,
}

/// The shallowest path on the way to `rel` whose parent is an indexed directory.
fn attach_point(tree: &TreeIndex, rel: &Path) -> PathBuf {
    let mut anchor = rel.to_path_buf();
    while !anchor.as_os_str().is_empty() && !tree.has_parent_dir(&anchor) {
        match anchor.parent() {
            Some(parent) => anchor = parent.to_path_buf(),
            None => break,
        }
    }
    anchor
}

impl Reconciler {
    pub fn new(
        filter: Arc<PathFilter>,
        tree: Arc<RwLock<TreeIndex>>,
        cookies: Arc<CookieJar>,
        stream: EventStream,
    ) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Priming);
        Self {
            filter,
            tree,
            cookies,
            stream,
            state,
            recrawls: Arc::new(AtomicU64::new(0)),
            unconfirmed: Vec::new(),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    /// Shared counter of completed recrawls.
    pub fn recrawl_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.recrawls)
    }

    fn root(&self) -> &Path {
        self.filter.root()
    }

    async fn crawl(&self, anchor: PathBuf) -> std::io::Result<Option<Vec<CrawlEntry>>> {
        let filter = Arc::clone(&self.filter);
        tokio::task::spawn_blocking(move || walker::crawl(&filter, &anchor))
            .await
            .map_err(std::io::Error::other)?
    }

    /// Populate the tree with a full crawl of the root.
    ///
    /// Events arriving meanwhile stay queued and are applied by `run`.
    pub async fn prime(&mut self) -> Result<()> {
        self.state.send_replace(ReconcilerState::Priming);
        let entries = self
            .crawl(PathBuf::new())
            .await?
            .ok_or_else(|| WatchError::InvalidPath {
                path: self.root().to_path_buf(),
                reason: "directory vanished during the initial crawl".to_owned(),
            })?;

        let mut tree = self.tree.write().await;
        tree.replace_subtree(Path::new(""), &entries, 0);
        if tree.is_empty() {
            debug!("primed {}: directory is empty", self.root().display());
        } else {
            info!("primed {} with {} entries", self.root().display(), tree.len());
        }
        Ok(())
    }

    /// Consume events until `shutdown` fires or the stream closes.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        self.state.send_replace(ReconcilerState::Live);
        debug!("reconciler for {} is live", self.root().display());

        loop {
            let first = tokio::select! {
                _ = &mut shutdown => break,
                event = self.stream.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match self.stream.try_recv() {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }

            if self.stream.take_overflow() {
                self.resync("event queue overflowed").await;
                continue;
            }

            for event in batch {
                let overflow = matches!(event.kind, ChangeKind::Overflow);
                self.apply(event).await;
                // The recrawl covers everything still in the batch.
                if overflow {
                    break;
                }
            }

            let purged = self.tree.write().await.purge_tombstones();
            if purged > 0 {
                debug!("purged {purged} tombstones in {}", self.root().display());
            }

            if self.stream.take_overflow() {
                self.resync("event queue overflowed").await;
            }
        }

        debug!("reconciler for {} stopped", self.root().display());
    }

    /// Apply a single event to the tree.
    pub async fn apply(&mut self, event: WatchEvent) {
        let seq = event.seq;

        match &event.kind {
            ChangeKind::Created(rel) | ChangeKind::Modified(rel) if self.filter.is_cookie(rel) => {
                self.apply_cookie(rel, seq).await;
                return;
            }
            ChangeKind::Removed(rel) if self.filter.is_cookie(rel) => return,
            ChangeKind::Renamed { from, to }
                if self.filter.is_cookie(from) || self.filter.is_cookie(to) =>
            {
                if self.filter.is_cookie(to) {
                    self.apply_cookie(to, seq).await;
                }
                return;
            }
            _ => {}
        }

        match event.kind {
            ChangeKind::Created(rel) => self.apply_created(&rel, seq).await,
            ChangeKind::Modified(rel) => {
                let touched = self.tree.write().await.touch(&rel, seq);
                if !touched {
                    self.apply_created(&rel, seq).await;
                }
            }
            ChangeKind::Removed(rel) => {
                if rel.as_os_str().is_empty() {
                    warn!("watched root {} was removed", self.root().display());
                }
                self.tree.write().await.remove(&rel, seq);
            }
            ChangeKind::Renamed { from, to } => {
                let moved = self.tree.write().await.rename(&from, &to, seq);
                if !moved {
                    self.recrawl(&to, seq, Some(&from)).await;
                }
            }
            ChangeKind::Overflow => self.resync("watcher reported lost events").await,
        }
    }

    /// Settle point: revisit directories whose watch may have missed entries,
    /// then wake the query waiting on this cookie.
    async fn apply_cookie(&mut self, rel: &Path, seq: u64) {
        if !self.unconfirmed.is_empty() {
            let serial = self.cookies.serial_of(rel);
            for dir in std::mem::take(&mut self.unconfirmed) {
                let attached = self.tree.read().await.has_parent_dir(&dir.path);
                if !attached {
                    continue;
                }
                let exists = self
                    .crawl_into(&dir.path, seq, None)
                    .await
                    .is_some_and(|anchor| anchor == dir.path);
                let confirmed = serial.is_some_and(|serial| serial > dir.cookie_mark);
                if exists && !confirmed {
                    self.unconfirmed.push(dir);
                } else {
                    trace!("watch on {} confirmed", dir.path.display());
                }
            }
        }
        self.cookies.observe(rel).await;
    }

    async fn apply_created(&mut self, rel: &Path, seq: u64) {
        let metadata = match tokio::fs::symlink_metadata(self.root().join(rel)).await {
            Ok(m) => m,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Gone again already; the removal is further down the stream.
                self.tree.write().await.remove(rel, seq);
                return;
            }
            Err(err) => {
                warn!("failed to stat {}: {err}", rel.display());
                return;
            }
        };

        let kind = EntryKind::from_file_type(metadata.file_type());
        if kind == EntryKind::Directory {
            // Entries created before the new directory's OS watch was armed produce no events.
            self.recrawl(rel, seq, None).await;
            return;
        }

        let inserted = self.tree.write().await.insert(rel, kind, seq);
        trace!("created {} ({})", rel.display(), kind.as_code());
        if !inserted {
            self.recrawl(rel, seq, None).await;
        }
    }

    /// Re-read `rel` from disk, starting at its nearest indexed ancestor, and
    /// splice the result in. `also_remove` is dropped under the same write guard.
    ///
    /// A crawled directory stays on the unconfirmed list until a later cookie
    /// shows its watch is armed.
    async fn recrawl(&mut self, rel: &Path, seq: u64, also_remove: Option<&Path>) {
        let Some(anchor) = self.crawl_into(rel, seq, also_remove).await else {
            return;
        };
        if anchor.as_os_str().is_empty() {
            return;
        }

        let cookie_mark = self.cookies.issued();
        match self.unconfirmed.iter_mut().find(|dir| dir.path == anchor) {
            Some(dir) => dir.cookie_mark = cookie_mark,
            None => self.unconfirmed.push(Unconfirmed {
                path: anchor,
                cookie_mark,
            }),
        }
    }

    /// Crawl from the nearest indexed ancestor of `rel` and replace that subtree.
    ///
    /// Returns the crawled anchor when it is a directory that still exists.
    async fn crawl_into(
        &mut self,
        rel: &Path,
        seq: u64,
        also_remove: Option<&Path>,
    ) -> Option<PathBuf> {
        let anchor = {
            let tree = self.tree.read().await;
            attach_point(&tree, rel)
        };

        let entries = match self.crawl(anchor.clone()).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to crawl {}: {err}", anchor.display());
                return None;
            }
        };

        let mut tree = self.tree.write().await;
        if let Some(from) = also_remove {
            tree.remove(from, seq);
        }
        match entries {
            Some(entries) => {
                let is_dir = anchor.as_os_str().is_empty()
                    || entries
                        .first()
                        .is_some_and(|e| e.kind == EntryKind::Directory);
                tree.replace_subtree(&anchor, &entries, seq);
                is_dir.then_some(anchor)
            }
            None => {
                tree.remove(&anchor, seq);
                None
            }
        }
    }

    /// Throw away queued events and rebuild the whole tree from disk.
    async fn resync(&mut self, reason: &str) {
        self.state.send_replace(ReconcilerState::Resyncing);
        warn!("recrawling {}: {reason}", self.root().display());

        // Anything dropped up to this point happened before the crawl starts.
        self.stream.take_overflow();
        let dropped = self.stream.discard_pending();
        let cookies = self.cookies.pending_names().await;

        match self.crawl(PathBuf::new()).await {
            Ok(Some(entries)) => {
                let mut tree = self.tree.write().await;
                let seq = tree.last_seq();
                tree.replace_subtree(Path::new(""), &entries, seq);
            }
            Ok(None) => {
                warn!("watched root {} is gone", self.root().display());
                self.tree.write().await.clear();
            }
            Err(err) => warn!("recrawl of {} failed: {err}", self.root().display()),
        }

        let released = self.cookies.release(&cookies).await;
        self.state.send_replace(ReconcilerState::Live);
        let total = self.recrawls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "recrawled {} (#{total}, {dropped} queued events dropped, {released} cookies released)",
            self.root().display()
        );
    }
}
