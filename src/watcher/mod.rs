pub mod event;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::error::{Result, WatchError};
use crate::walker::PathFilter;
use event::{ChangeKind, WatchEvent};

/// Handle to a running OS watcher. Dropping it stops the notifications.
pub struct WatcherHandle {
    /// Keep alive: dropping the watcher stops the OS subscription.
    _watcher: notify::RecommendedWatcher,
}

/// Producer half of a root's event queue.
///
/// Sends never block; a full queue raises the overflow flag instead.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<WatchEvent>,
    overflowed: Arc<AtomicBool>,
    next_seq: Arc<AtomicU64>,
}

/// Consumer half of a root's event queue: a lazy, unbounded, non-seekable
/// sequence of events.
pub struct EventStream {
    rx: mpsc::Receiver<WatchEvent>,
    overflowed: Arc<AtomicBool>,
}

/// Create a bounded event queue.
pub fn channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflowed = Arc::new(AtomicBool::new(false));
    (
        EventSink {
            tx,
            overflowed: Arc::clone(&overflowed),
            next_seq: Arc::new(AtomicU64::new(0)),
        },
        EventStream { rx, overflowed },
    )
}

impl EventSink {
    /// Stamp a change with the root's next sequence number and queue it.
    /// Returns `false` once the consumer is gone.
    pub fn push(&self, kind: ChangeKind) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        match self.tx.try_send(WatchEvent { seq, kind }) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                if !self.overflowed.swap(true, Ordering::SeqCst) {
                    warn!("[watcher] event queue full at seq {}, recrawl scheduled", dropped.seq);
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Report (and clear) whether events were dropped since the last call.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::SeqCst)
    }

    /// Throw away everything currently queued. Returns how many events were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// A "renamed from" notification waiting for its "renamed to" half.
#[derive(Debug)]
struct PendingFrom {
    tracker: Option<usize>,
    path: PathBuf,
}

/// Turns raw `notify` events into `ChangeKind`s for one root.
///
/// This is the only place that knows about notify's event shapes.
pub struct EventTranslator {
    filter: PathFilter,
    pending_from: Option<PendingFrom>,
}

impl EventTranslator {
    pub fn new(filter: PathFilter) -> Self {
        Self {
            filter,
            pending_from: None,
        }
    }

    /// Relative path for an absolute notification path, or `None` when the path
    /// is outside the root or must not be indexed. Cookies always pass.
    fn visible(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(self.filter.root()).ok()?;
        if self.filter.is_cookie(rel) {
            return Some(rel.to_path_buf());
        }
        if self.filter.is_ignored(rel, path.is_dir()) {
            return None;
        }
        Some(rel.to_path_buf())
    }

    /// An unpaired "renamed from" means the entry left the root.
    fn flush_pending(&mut self, out: &mut Vec<ChangeKind>) {
        if let Some(pending) = self.pending_from.take()
            && let Some(rel) = self.visible(&pending.path)
        {
            out.push(ChangeKind::Removed(rel));
        }
    }

    fn created(&mut self, path: &Path, out: &mut Vec<ChangeKind>) {
        if let Some(rel) = self.visible(path)
            && !rel.as_os_str().is_empty()
        {
            out.push(ChangeKind::Created(rel));
        }
    }

    fn removed(&mut self, path: &Path, out: &mut Vec<ChangeKind>) {
        if let Some(rel) = self.visible(path) {
            out.push(ChangeKind::Removed(rel));
        }
    }

    fn modified(&mut self, path: &Path, out: &mut Vec<ChangeKind>) {
        if let Some(rel) = self.visible(path) {
            out.push(ChangeKind::Modified(rel));
        }
    }

    /// Classify by what is on disk now, for notifications that do not say.
    fn by_existence(&mut self, path: &Path, out: &mut Vec<ChangeKind>) {
        if path.symlink_metadata().is_ok() {
            self.created(path, out);
        } else {
            self.removed(path, out);
        }
    }

    fn renamed(&mut self, from: &Path, to: &Path, out: &mut Vec<ChangeKind>) {
        match (self.visible(from), self.visible(to)) {
            (Some(from), Some(to)) => out.push(ChangeKind::Renamed { from, to }),
            (Some(from), None) => out.push(ChangeKind::Removed(from)),
            (None, Some(to)) => out.push(ChangeKind::Created(to)),
            (None, None) => {}
        }
    }

    /// Translate one raw notification into zero or more events.
    pub fn translate(&mut self, result: notify::Result<notify::Event>) -> Vec<ChangeKind> {
        let mut out = Vec::new();

        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!("[watcher] error: {err}");
                self.flush_pending(&mut out);
                out.push(ChangeKind::Overflow);
                return out;
            }
        };
        trace!("[watcher] raw {:?} {:?}", event.kind, event.paths);

        if event.need_rescan() {
            self.flush_pending(&mut out);
            out.push(ChangeKind::Overflow);
            return out;
        }

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.flush_pending(&mut out);
                if let Some(path) = event.paths.first() {
                    self.pending_from = Some(PendingFrom {
                        tracker: event.tracker(),
                        path: path.clone(),
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let paired = self
                    .pending_from
                    .as_ref()
                    .is_some_and(|p| p.tracker.is_some() && p.tracker == event.tracker());
                // A paired "to" is followed by a "both" carrying the two paths.
                if !paired {
                    self.flush_pending(&mut out);
                    for path in &event.paths {
                        self.created(path, &mut out);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let matches_pending = self
                    .pending_from
                    .as_ref()
                    .is_some_and(|p| event.paths.first() == Some(&p.path));
                if matches_pending {
                    self.pending_from = None;
                } else {
                    self.flush_pending(&mut out);
                }
                match event.paths.as_slice() {
                    [from, to] => self.renamed(from, to, &mut out),
                    paths => {
                        for path in paths {
                            self.by_existence(path, &mut out);
                        }
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                self.flush_pending(&mut out);
                for path in &event.paths {
                    self.by_existence(path, &mut out);
                }
            }
            EventKind::Create(_) => {
                self.flush_pending(&mut out);
                for path in &event.paths {
                    self.created(path, &mut out);
                }
            }
            EventKind::Remove(_) => {
                self.flush_pending(&mut out);
                for path in &event.paths {
                    self.removed(path, &mut out);
                }
            }
            EventKind::Modify(_) => {
                self.flush_pending(&mut out);
                for path in &event.paths {
                    self.modified(path, &mut out);
                }
            }
            EventKind::Access(_) => {
                self.flush_pending(&mut out);
            }
            EventKind::Any | EventKind::Other => {
                self.flush_pending(&mut out);
                for path in &event.paths {
                    self.by_existence(path, &mut out);
                }
            }
        }

        out
    }
}

/// Start a recursive OS watcher on the filter's root, feeding `sink`.
///
/// Returns a `WatcherHandle` that must be kept alive. Events queue up from the
/// moment this returns, so callers may crawl first and consume afterwards
/// without a gap.
pub fn start_watcher(filter: PathFilter, sink: EventSink) -> Result<WatcherHandle> {
    let root = filter.root().to_path_buf();
    let mut translator = EventTranslator::new(filter);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        for change in translator.translate(res) {
            if !sink.push(change) {
                return; // receiver dropped, shutdown
            }
        }
    })
    .map_err(|source| WatchError::Watcher {
        root: root.clone(),
        source,
    })?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|source| WatchError::Watcher {
            root: root.clone(),
            source,
        })?;

    Ok(WatcherHandle { _watcher: watcher })
}
