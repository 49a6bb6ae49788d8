use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

use crate::config::RootConfig;
use crate::tree::node::EntryKind;

/// One entry discovered by a crawl, relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Decides which paths under a root are indexed.
///
/// Shared by crawls and by the event adapter so that both agree on what
/// the index may contain.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    ignore_dirs: Vec<String>,
    exclude: Vec<glob::Pattern>,
    cookie_prefix: String,
    gitignore: Option<Gitignore>,
}

/// Build a Gitignore matcher from the root's .gitignore file.
/// If no .gitignore exists, returns an empty matcher that matches nothing.
fn build_gitignore_matcher(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    let gitignore_path = root.join(".gitignore");
    if gitignore_path.exists()
        && let Some(err) = builder.add(&gitignore_path)
    {
        warn!("ignoring part of {}: {err}", gitignore_path.display());
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

impl PathFilter {
    pub fn new(root: &Path, config: &RootConfig, cookie_prefix: &str) -> Self {
        let exclude = config
            .exclude
            .iter()
            .flatten()
            .filter_map(|pattern| match glob::Pattern::new(pattern) {
                Ok(p) => Some(p),
                Err(err) => {
                    warn!("invalid exclude pattern '{pattern}': {err}");
                    None
                }
            })
            .collect();

        Self {
            root: root.to_path_buf(),
            ignore_dirs: config.ignore_dirs.clone(),
            exclude,
            cookie_prefix: cookie_prefix.to_owned(),
            gitignore: config
                .honor_gitignore
                .then(|| build_gitignore_matcher(root)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True for settle cookies: a single top-level name carrying the cookie prefix.
    pub fn is_cookie(&self, rel: &Path) -> bool {
        let mut components = rel.components();
        match (components.next(), components.next()) {
            (Some(first), None) => first
                .as_os_str()
                .to_str()
                .is_some_and(|name| name.starts_with(&self.cookie_prefix)),
            _ => false,
        }
    }

    /// True if `rel` must never appear in the index.
    ///
    /// `is_dir` only matters for directory-only gitignore rules.
    pub fn is_ignored(&self, rel: &Path, is_dir: bool) -> bool {
        if rel.as_os_str().is_empty() {
            return false;
        }
        if self.is_cookie(rel) {
            return true;
        }

        if rel.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|s| self.ignore_dirs.iter().any(|d| d == s))
        }) {
            return true;
        }

        let rel_str = rel.to_string_lossy();
        for pattern in &self.exclude {
            if pattern.matches(&rel_str) {
                return true;
            }
            // Also check if any component matches the pattern directly.
            if rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .any(|s| pattern.matches(s))
            {
                return true;
            }
        }

        if let Some(gitignore) = &self.gitignore {
            return gitignore
                .matched_path_or_any_parents(self.root.join(rel), is_dir)
                .is_ignore();
        }

        false
    }
}

/// Crawl `anchor` (relative to the filter's root) from disk.
///
/// Returns `None` when the anchor does not exist or is ignored. Otherwise the
/// entries come parents first, starting with the anchor itself unless the
/// anchor is the root. Symlinks are listed but not followed.
pub fn crawl(filter: &PathFilter, anchor: &Path) -> std::io::Result<Option<Vec<CrawlEntry>>> {
    let start = filter.root().join(anchor);
    let metadata = match std::fs::symlink_metadata(&start) {
        Ok(m) => m,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if filter.is_ignored(anchor, metadata.is_dir()) {
        return Ok(None);
    }

    let kind = EntryKind::from_file_type(metadata.file_type());
    if kind != EntryKind::Directory {
        return Ok(Some(vec![CrawlEntry {
            path: anchor.to_path_buf(),
            kind,
        }]));
    }

    let walk_filter = filter.clone();
    let walker = ignore::WalkBuilder::new(&start)
        // Index everything; hidden files and VCS ignores are decided by PathFilter.
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            match entry.path().strip_prefix(walk_filter.root()) {
                Ok(rel) => !walk_filter.is_ignored(rel, is_dir),
                Err(_) => false,
            }
        })
        .build();

    let mut entries = Vec::new();
    for result in walker {
        let entry = match result {
            Ok(e) => e,
            Err(err) => {
                // Entries vanishing mid-crawl are expected; the event stream catches up.
                debug!("crawl: {err}");
                continue;
            }
        };

        let Ok(rel) = entry.path().strip_prefix(filter.root()) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let kind = entry
            .file_type()
            .map(EntryKind::from_file_type)
            .unwrap_or(EntryKind::File);
        entries.push(CrawlEntry {
            path: rel.to_path_buf(),
            kind,
        });
    }

    Ok(Some(entries))
}
