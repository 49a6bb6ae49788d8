use std::path::PathBuf;

/// A normalized change to a watched root. Paths are relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// An entry appeared at the path.
    Created(PathBuf),
    /// The entry at the path (and its subtree) is gone.
    Removed(PathBuf),
    /// An entry moved within the root.
    Renamed { from: PathBuf, to: PathBuf },
    /// Content or metadata changed; the tree structure did not.
    Modified(PathBuf),
    /// Notifications were lost; the whole root must be recrawled.
    Overflow,
}

/// A change tagged with its per-root sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub seq: u64,
    pub kind: ChangeKind,
}
