use std::path::{Component, Path, PathBuf};

use crate::error::{Result, WatchError};
use crate::tree::TreeIndex;
use crate::tree::node::EntryKind;
use crate::walker::PathFilter;

/// Restricts which live entries a query lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Only list entries of this kind.
    pub kind: Option<EntryKind>,
    /// Only list entries at or below these relative paths. Empty means the whole root.
    pub under: Vec<PathBuf>,
}

impl QueryFilter {
    /// Every live entry of the root.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn under<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            kind: None,
            under: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Reject subtree paths that could escape the root.
    pub fn validate(&self, root: &Path) -> Result<()> {
        for rel in &self.under {
            let escapes = rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(WatchError::InvalidPath {
                    path: root.join(rel),
                    reason: format!("'{}' is not relative to the root", rel.display()),
                });
            }
        }
        Ok(())
    }
}

/// The result of a query: relative paths in listing order.
///
/// Captured under a single read guard, so it reflects one consistent state
/// of the tree even while the reconciler keeps applying events.
#[derive(Debug)]
pub struct Listing {
    paths: std::vec::IntoIter<PathBuf>,
}

impl Listing {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into_iter(),
        }
    }
}

impl Iterator for Listing {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        self.paths.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.paths.size_hint()
    }
}

impl ExactSizeIterator for Listing {}

/// Walk the tree and collect the entries selected by `query`.
///
/// The tree must already be settled; the caller holds the read guard.
pub fn collect(tree: &TreeIndex, filter: &PathFilter, query: &QueryFilter) -> Listing {
    let mut entries = if query.under.is_empty() {
        tree.entries()
    } else {
        let mut merged: Vec<(PathBuf, EntryKind)> = query
            .under
            .iter()
            .flat_map(|rel| tree.entries_under(rel))
            .collect();
        if query.under.len() > 1 {
            // Component-wise path order is the depth-first listing order.
            merged.sort_by(|a, b| a.0.cmp(&b.0));
            merged.dedup_by(|a, b| a.0 == b.0);
        }
        merged
    };

    entries.retain(|(path, kind)| {
        !filter.is_cookie(path) && query.kind.is_none_or(|wanted| wanted == *kind)
    });

    Listing::new(entries.into_iter().map(|(path, _)| path).collect())
}
