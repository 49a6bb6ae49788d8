use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Per-root configuration file, read from the root directory at watch time.
pub const ROOT_CONFIG_FILE: &str = ".treewatch.toml";

/// Service-wide settings shared by every watched root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upper bound on how long a query waits for its settle cookie.
    pub settle_timeout_ms: u64,
    /// Capacity of the per-root queue between the OS watcher and the reconciler.
    /// A full queue turns into an overflow and a recrawl.
    pub queue_capacity: usize,
    /// Name prefix of the cookie files written by the settle barrier.
    pub cookie_prefix: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            settle_timeout_ms: 10_000,
            queue_capacity: 4096,
            cookie_prefix: ".treewatch-cookie-".to_owned(),
        }
    }
}

impl ServiceConfig {
    /// Load service settings from a TOML file.
    ///
    /// Unlike the per-root file, an explicitly named service config must exist and parse.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config = toml::from_str::<Self>(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Configuration loaded from `.treewatch.toml` at a watched root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Directory names that are never indexed, at any depth.
    pub ignore_dirs: Vec<String>,
    /// Additional glob patterns to exclude, matched against the relative path and each component.
    pub exclude: Option<Vec<String>>,
    /// Apply the root's `.gitignore` rules to crawls and events.
    pub honor_gitignore: bool,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: vec![".git".to_owned(), ".hg".to_owned(), ".svn".to_owned()],
            exclude: None,
            honor_gitignore: false,
        }
    }
}

impl RootConfig {
    /// Load configuration from `.treewatch.toml` in the given root directory.
    ///
    /// Returns the default configuration if the file does not exist or cannot be parsed.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join(ROOT_CONFIG_FILE);

        if !config_path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!("failed to parse {}: {err}. Using defaults.", config_path.display());
                    Self::default()
                }
            },
            Err(err) => {
                warn!("failed to read {}: {err}. Using defaults.", config_path.display());
                Self::default()
            }
        }
    }
}
