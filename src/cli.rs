use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Watches directory trees and answers listing queries that reflect every
/// change made before the query was issued.
#[derive(Parser, Debug)]
#[command(
    name = "treewatch",
    version,
    about,
    long_about = None,
    propagate_version = true,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for listings.
#[derive(Clone, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One relative path per line (default).
    #[default]
    Compact,
    /// A JSON object with the root and its files.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch a directory, wait for it to settle, and list its entries.
    Find {
        /// Directory to list.
        path: PathBuf,

        /// Only list entries at or below these paths (relative to the directory).
        #[arg(long = "under", value_name = "REL")]
        under: Vec<PathBuf>,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
        format: OutputFormat,

        /// Override the settle timeout from the service config.
        #[arg(long)]
        settle_timeout_ms: Option<u64>,

        /// Service configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Answer JSON command arrays read from stdin, one per line.
    ///
    /// Each request is a JSON array whose first element is the command name,
    /// e.g. ["watch", "/abs/dir"] or ["find", "/abs/dir"]. Replies are written
    /// to stdout, one JSON object per line.
    Serve {
        /// Service configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
