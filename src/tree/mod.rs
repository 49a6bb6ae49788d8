pub mod node;

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableGraph};

use crate::walker::CrawlEntry;
use node::{EdgeKind, EntryKind, TreeEntry};

/// The in-memory mirror of one watched root: an arena of entries in a petgraph
/// StableGraph, with name-keyed child maps for lookup and `ChildOf` edges for the
/// way back up.
///
/// All paths taken and returned are relative to the watched root.
pub struct TreeIndex {
    pub graph: StableGraph<TreeEntry, EdgeKind>,
    root: NodeIndex,
    /// Entries marked deleted and waiting for `purge_tombstones`.
    tombstones: Vec<NodeIndex>,
    last_seq: u64,
}

/// Split a relative path into its names. `None` for absolute paths or `..`.
fn split(rel: &Path) -> Option<Vec<&OsStr>> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts)
}

impl TreeIndex {
    /// Create an index holding only the root directory.
    pub fn new() -> Self {
        let mut graph = StableGraph::new();
        let root = graph.add_node(TreeEntry::new(Default::default(), EntryKind::Directory, 0));
        Self {
            graph,
            root,
            tombstones: Vec::new(),
            last_seq: 0,
        }
    }

    /// Highest sequence number applied so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn record(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    fn lookup_parts(&self, parts: &[&OsStr]) -> Option<NodeIndex> {
        let mut current = self.root;
        for name in parts {
            current = *self.graph[current].children.get(*name)?;
        }
        Some(current)
    }

    fn is_live_dir(&self, idx: NodeIndex) -> bool {
        let entry = &self.graph[idx];
        entry.exists && entry.kind == EntryKind::Directory
    }

    /// Resolve a relative path to its node, tombstoned entries included.
    pub fn lookup(&self, rel: &Path) -> Option<NodeIndex> {
        self.lookup_parts(&split(rel)?)
    }

    /// Resolve a relative path to a live entry.
    #[cfg(test)]
    pub fn get(&self, rel: &Path) -> Option<&TreeEntry> {
        self.lookup(rel)
            .map(|idx| &self.graph[idx])
            .filter(|entry| entry.exists)
    }

    /// True if the parent directory of `rel` is a live directory in the index.
    pub fn has_parent_dir(&self, rel: &Path) -> bool {
        let Some(parts) = split(rel) else {
            return false;
        };
        match parts.split_last() {
            Some((_, parent)) => self
                .lookup_parts(parent)
                .is_some_and(|idx| self.is_live_dir(idx)),
            None => false,
        }
    }

    /// The parent directory of an entry, found through its `ChildOf` edge.
    pub fn parent_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .next()
    }

    /// Rebuild the relative path of an entry by walking up to the root.
    #[cfg(test)]
    pub fn path_of(&self, idx: NodeIndex) -> PathBuf {
        let mut names = Vec::new();
        let mut current = idx;
        while current != self.root {
            names.push(self.graph[current].name.as_os_str());
            match self.parent_of(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        names.iter().rev().collect()
    }

    fn attach(&mut self, parent: NodeIndex, name: &OsStr, kind: EntryKind, seq: u64) -> NodeIndex {
        let idx = self.graph.add_node(TreeEntry::new(name.to_os_string(), kind, seq));
        self.graph.add_edge(idx, parent, EdgeKind::ChildOf);
        self.graph[parent].children.insert(name.to_os_string(), idx);
        idx
    }

    /// Unlink an entry from its parent without freeing it.
    fn detach(&mut self, idx: NodeIndex) {
        if let Some(parent) = self.parent_of(idx) {
            let name = self.graph[idx].name.clone();
            self.graph[parent].children.remove(&name);
            if let Some(edge) = self.graph.find_edge(idx, parent) {
                self.graph.remove_edge(edge);
            }
        }
    }

    /// Free every descendant of `idx`, leaving `idx` itself in place.
    fn drop_descendants(&mut self, idx: NodeIndex) {
        let mut stack: Vec<NodeIndex> = std::mem::take(&mut self.graph[idx].children)
            .into_values()
            .collect();
        while let Some(child) = stack.pop() {
            if let Some(entry) = self.graph.remove_node(child) {
                stack.extend(entry.children.into_values());
            }
        }
    }

    /// Unlink and free an entry together with its subtree.
    fn delete_subtree(&mut self, idx: NodeIndex) {
        self.drop_descendants(idx);
        self.detach(idx);
        self.graph.remove_node(idx);
    }

    /// Insert an entry at `rel`, replacing a stale entry of another kind and
    /// reviving a tombstone of the same kind.
    ///
    /// Returns `false` when the parent directory is not in the index.
    pub fn insert(&mut self, rel: &Path, kind: EntryKind, seq: u64) -> bool {
        let Some(parts) = split(rel) else {
            return false;
        };
        let Some((name, parent_parts)) = parts.split_last() else {
            return false;
        };
        let Some(parent) = self
            .lookup_parts(parent_parts)
            .filter(|&idx| self.is_live_dir(idx))
        else {
            return false;
        };

        self.record(seq);
        if let Some(&existing) = self.graph[parent].children.get(*name) {
            let entry = &mut self.graph[existing];
            if entry.kind == kind {
                entry.exists = true;
                entry.seq = seq;
                return true;
            }
            self.delete_subtree(existing);
        }
        self.attach(parent, name, kind, seq);
        true
    }

    /// Mark the entry at `rel` deleted and drop its descendants.
    ///
    /// The entry itself stays as a tombstone until `purge_tombstones`.
    /// Removing the root path empties the index.
    pub fn remove(&mut self, rel: &Path, seq: u64) -> bool {
        let Some(idx) = self.lookup(rel) else {
            return false;
        };
        self.record(seq);
        if idx == self.root {
            self.drop_descendants(idx);
            return true;
        }
        if !self.graph[idx].exists {
            return false;
        }
        self.drop_descendants(idx);
        let entry = &mut self.graph[idx];
        entry.exists = false;
        entry.seq = seq;
        self.tombstones.push(idx);
        true
    }

    /// Bump the sequence number of a live entry.
    pub fn touch(&mut self, rel: &Path, seq: u64) -> bool {
        let Some(idx) = self.lookup(rel).filter(|&idx| self.graph[idx].exists) else {
            return false;
        };
        self.record(seq);
        self.graph[idx].seq = seq;
        true
    }

    /// Move the subtree at `from` to `to` as a single mutation.
    ///
    /// Anything already at `to` is replaced. Returns `false`, leaving the index
    /// untouched, when `from` is unknown, when the parent of `to` is unknown, or
    /// when one path is inside the other.
    pub fn rename(&mut self, from: &Path, to: &Path, seq: u64) -> bool {
        let (Some(from_parts), Some(to_parts)) = (split(from), split(to)) else {
            return false;
        };
        if from_parts.is_empty() || to_parts.is_empty() {
            return false;
        }
        if from_parts == to_parts {
            return self.touch(from, seq);
        }
        if to_parts.starts_with(&from_parts) || from_parts.starts_with(&to_parts) {
            return false;
        }

        let Some(src) = self
            .lookup_parts(&from_parts)
            .filter(|&idx| self.graph[idx].exists)
        else {
            return false;
        };
        let Some((to_name, to_parent_parts)) = to_parts.split_last() else {
            return false;
        };
        let Some(dst_parent) = self
            .lookup_parts(to_parent_parts)
            .filter(|&idx| self.is_live_dir(idx))
        else {
            return false;
        };

        if let Some(&existing) = self.graph[dst_parent].children.get(*to_name) {
            self.delete_subtree(existing);
        }
        self.detach(src);
        {
            let entry = &mut self.graph[src];
            entry.name = to_name.to_os_string();
            entry.seq = seq;
        }
        self.graph.add_edge(src, dst_parent, EdgeKind::ChildOf);
        self.graph[dst_parent]
            .children
            .insert(to_name.to_os_string(), src);
        self.record(seq);
        true
    }

    /// Replace whatever is at `anchor` with freshly crawled entries.
    ///
    /// `entries` must list parents before children and, unless `anchor` is the
    /// root, start with `anchor` itself. Returns `false` when the parent of
    /// `anchor` is not in the index.
    pub fn replace_subtree(&mut self, anchor: &Path, entries: &[CrawlEntry], seq: u64) -> bool {
        let Some(parts) = split(anchor) else {
            return false;
        };
        match parts.split_last() {
            None => {
                self.drop_descendants(self.root);
                self.tombstones.clear();
            }
            Some((name, parent_parts)) => {
                let Some(parent) = self
                    .lookup_parts(parent_parts)
                    .filter(|&idx| self.is_live_dir(idx))
                else {
                    return false;
                };
                if let Some(&existing) = self.graph[parent].children.get(*name) {
                    self.delete_subtree(existing);
                }
            }
        }
        for entry in entries {
            self.insert(&entry.path, entry.kind, seq);
        }
        self.record(seq);
        true
    }

    /// Free every tombstoned entry. Returns how many were purged.
    pub fn purge_tombstones(&mut self) -> usize {
        let mut purged = 0;
        for idx in std::mem::take(&mut self.tombstones) {
            // Indices are reused by StableGraph; only free what is still a tombstone.
            match self.graph.node_weight(idx) {
                Some(entry) if !entry.exists => {
                    self.delete_subtree(idx);
                    purged += 1;
                }
                _ => {}
            }
        }
        purged
    }

    /// Live entries at and below `rel`, depth-first, each directory before its
    /// children, siblings in name order. The root itself is never listed.
    pub fn entries_under(&self, rel: &Path) -> Vec<(PathBuf, EntryKind)> {
        let Some(parts) = split(rel) else {
            return Vec::new();
        };
        let Some(start) = self.lookup_parts(&parts) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut stack: Vec<(NodeIndex, PathBuf)> = vec![(start, parts.iter().collect())];
        while let Some((idx, path)) = stack.pop() {
            let entry = &self.graph[idx];
            if !entry.exists {
                continue;
            }
            if idx != self.root {
                out.push((path.clone(), entry.kind));
            }
            for (name, &child) in entry.children.iter().rev() {
                stack.push((child, path.join(name)));
            }
        }
        out
    }

    /// Every live entry in the index, in listing order.
    pub fn entries(&self) -> Vec<(PathBuf, EntryKind)> {
        self.entries_under(Path::new(""))
    }

    /// Number of live entries, excluding the root.
    pub fn len(&self) -> usize {
        self.graph
            .node_indices()
            .filter(|&idx| idx != self.root && self.graph[idx].exists)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything but the root.
    pub fn clear(&mut self) {
        self.drop_descendants(self.root);
        self.tombstones.clear();
    }
}

impl Default for TreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(tree: &TreeIndex) -> Vec<String> {
        tree.entries()
            .into_iter()
            .map(|(p, _)| p.to_string_lossy().into_owned())
            .collect()
    }

    fn sample() -> TreeIndex {
        let mut tree = TreeIndex::new();
        assert!(tree.insert(Path::new("foo.c"), EntryKind::File, 1));
        assert!(tree.insert(Path::new("adir"), EntryKind::Directory, 2));
        assert!(tree.insert(Path::new("adir/subdir"), EntryKind::Directory, 3));
        assert!(tree.insert(Path::new("adir/subdir/file"), EntryKind::File, 4));
        tree
    }

    #[test]
    fn test_listing_is_depth_first_and_name_ordered() {
        let tree = sample();
        assert_eq!(
            paths(&tree),
            vec!["adir", "adir/subdir", "adir/subdir/file", "foo.c"]
        );
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.last_seq(), 4);
    }

    #[test]
    fn test_insert_requires_indexed_parent() {
        let mut tree = TreeIndex::new();
        assert!(!tree.insert(Path::new("missing/file"), EntryKind::File, 1));
        assert!(tree.is_empty());
        assert!(!tree.has_parent_dir(Path::new("missing/file")));
        assert!(tree.has_parent_dir(Path::new("top")));
    }

    #[test]
    fn test_insert_under_file_is_rejected() {
        let mut tree = sample();
        assert!(!tree.insert(Path::new("foo.c/nested"), EntryKind::File, 9));
    }

    #[test]
    fn test_remove_tombstones_then_purges() {
        let mut tree = sample();
        assert!(tree.remove(Path::new("adir"), 5));
        assert_eq!(paths(&tree), vec!["foo.c"]);
        // Tombstone still resolvable until purged; descendants are already gone.
        assert!(tree.lookup(Path::new("adir")).is_some());
        assert!(tree.lookup(Path::new("adir/subdir")).is_none());

        assert_eq!(tree.purge_tombstones(), 1);
        assert!(tree.lookup(Path::new("adir")).is_none());
        assert_eq!(tree.graph.node_count(), 2, "root and foo.c remain");
    }

    #[test]
    fn test_remove_twice_reports_false() {
        let mut tree = sample();
        assert!(tree.remove(Path::new("foo.c"), 5));
        assert!(!tree.remove(Path::new("foo.c"), 6));
        assert!(!tree.remove(Path::new("nothing"), 7));
    }

    #[test]
    fn test_touch_delete_touch_revives_entry() {
        let mut tree = TreeIndex::new();
        tree.insert(Path::new("bar.txt"), EntryKind::File, 1);
        assert!(tree.get(Path::new("bar.txt")).is_some());

        tree.remove(Path::new("bar.txt"), 2);
        assert!(tree.get(Path::new("bar.txt")).is_none());

        tree.insert(Path::new("bar.txt"), EntryKind::File, 3);
        assert!(tree.get(Path::new("bar.txt")).is_some());
        assert_eq!(tree.get(Path::new("bar.txt")).unwrap().seq, 3);

        // Purging after the revive must not drop the live entry.
        assert_eq!(tree.purge_tombstones(), 0);
        assert_eq!(paths(&tree), vec!["bar.txt"]);
    }

    #[test]
    fn test_insert_with_new_kind_replaces_entry() {
        let mut tree = sample();
        assert!(tree.insert(Path::new("adir"), EntryKind::File, 5));
        assert_eq!(paths(&tree), vec!["adir", "foo.c"]);
        assert_eq!(tree.get(Path::new("adir")).unwrap().kind, EntryKind::File);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mut tree = sample();
        assert!(tree.rename(Path::new("adir/subdir"), Path::new("adir/overhere"), 5));
        assert_eq!(
            paths(&tree),
            vec!["adir", "adir/overhere", "adir/overhere/file", "foo.c"]
        );
        let file = tree.lookup(Path::new("adir/overhere/file")).unwrap();
        assert_eq!(tree.path_of(file), PathBuf::from("adir/overhere/file"));
    }

    #[test]
    fn test_rename_top_level_ancestor_rewrites_prefix() {
        let mut tree = sample();
        tree.rename(Path::new("adir/subdir"), Path::new("adir/overhere"), 5);
        assert!(tree.rename(Path::new("adir"), Path::new("bdir"), 6));
        assert_eq!(
            paths(&tree),
            vec!["bdir", "bdir/overhere", "bdir/overhere/file", "foo.c"]
        );
        assert!(tree.lookup(Path::new("adir")).is_none());
    }

    #[test]
    fn test_rename_replaces_destination() {
        let mut tree = sample();
        tree.insert(Path::new("other"), EntryKind::File, 5);
        assert!(tree.rename(Path::new("foo.c"), Path::new("other"), 6));
        assert_eq!(paths(&tree), vec!["adir", "adir/subdir", "adir/subdir/file", "other"]);
    }

    #[test]
    fn test_rename_rejects_unknown_and_nested() {
        let mut tree = sample();
        assert!(!tree.rename(Path::new("ghost"), Path::new("x"), 5));
        assert!(!tree.rename(Path::new("foo.c"), Path::new("nodir/x"), 5));
        assert!(!tree.rename(Path::new("adir"), Path::new("adir/subdir/inner"), 5));
        assert_eq!(
            paths(&tree),
            vec!["adir", "adir/subdir", "adir/subdir/file", "foo.c"]
        );
    }

    #[test]
    fn test_replace_subtree_swaps_contents() {
        let mut tree = sample();
        let crawled = vec![
            CrawlEntry {
                path: PathBuf::from("adir"),
                kind: EntryKind::Directory,
            },
            CrawlEntry {
                path: PathBuf::from("adir/fresh"),
                kind: EntryKind::File,
            },
        ];
        assert!(tree.replace_subtree(Path::new("adir"), &crawled, 7));
        assert_eq!(paths(&tree), vec!["adir", "adir/fresh", "foo.c"]);
    }

    #[test]
    fn test_replace_root_discards_everything() {
        let mut tree = sample();
        let crawled = vec![CrawlEntry {
            path: PathBuf::from("only"),
            kind: EntryKind::File,
        }];
        assert!(tree.replace_subtree(Path::new(""), &crawled, 8));
        assert_eq!(paths(&tree), vec!["only"]);
    }

    #[test]
    fn test_entries_under_scopes_listing() {
        let tree = sample();
        let scoped: Vec<String> = tree
            .entries_under(Path::new("adir/subdir"))
            .into_iter()
            .map(|(p, _)| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(scoped, vec!["adir/subdir", "adir/subdir/file"]);
        assert!(tree.entries_under(Path::new("nope")).is_empty());
    }

    #[test]
    fn test_rejects_parent_components() {
        let mut tree = sample();
        assert!(tree.lookup(Path::new("../escape")).is_none());
        assert!(!tree.insert(Path::new("adir/../x"), EntryKind::File, 9));
    }
}
