use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::FileType;

use petgraph::stable_graph::NodeIndex;

/// The kind of filesystem entry an index node mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file (or anything that is neither a directory nor a symlink).
    File,
    /// A directory; the only kind that carries children.
    Directory,
    /// A symbolic link. Never followed.
    Symlink,
}

impl EntryKind {
    pub fn from_file_type(file_type: FileType) -> Self {
        if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_symlink() {
            Self::Symlink
        } else {
            Self::File
        }
    }

    /// Single-letter code used in query filters: `f`, `d` or `l`.
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::File => "f",
            Self::Directory => "d",
            Self::Symlink => "l",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "f" => Some(Self::File),
            "d" => Some(Self::Directory),
            "l" => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// One entry in the tree index.
///
/// Directories own their children through `children`; the way back up is the
/// single `ChildOf` edge leaving the node.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Final path component. Empty for the root node.
    pub name: OsString,
    pub kind: EntryKind,
    /// False once the entry has been removed but not yet purged.
    pub exists: bool,
    /// Sequence number of the last event that touched this entry.
    pub seq: u64,
    /// Children keyed by name; always empty for non-directories.
    pub children: BTreeMap<OsString, NodeIndex>,
}

impl TreeEntry {
    pub fn new(name: OsString, kind: EntryKind, seq: u64) -> Self {
        Self {
            name,
            kind,
            exists: true,
            seq,
            children: BTreeMap::new(),
        }
    }
}

/// The kind of directed edge in the tree index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Entry -> Directory: the entry is a direct child of the directory.
    ChildOf,
}
