use std::path::PathBuf;
use std::time::Duration;

/// Failures surfaced by the watch core.
///
/// Overflow recovery is not represented here: a root that loses events
/// recrawls itself and keeps answering queries.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The requested root does not exist or is not a directory.
    #[error("unable to watch {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// The requested root is inside, or contains, a root that is already watched.
    #[error("unable to watch {path}: overlaps watched root {existing}")]
    NestedRoot { path: PathBuf, existing: PathBuf },

    /// A query or removal named a directory that is not being watched.
    #[error("unable to resolve root {0}: directory is not watched")]
    UnknownRoot(PathBuf),

    /// The settle cookie did not come back in time; the index may be stale.
    #[error("timed out after {waited:?} waiting for {root} to settle")]
    SettleTimeout { root: PathBuf, waited: Duration },

    /// The root was removed while the request was in flight.
    #[error("root {0} was removed while the request was in flight")]
    RootRemoved(PathBuf),

    /// The OS watcher could not be armed for the root.
    #[error("failed to start watcher for {root}: {source}")]
    Watcher {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = WatchError> = std::result::Result<T, E>;

impl WatchError {
    /// True for failures the caller can reasonably retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SettleTimeout { .. })
    }
}
