use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cli::OutputFormat;

/// A listing as rendered by `--format json`.
#[derive(Debug, Serialize)]
pub struct FindOutput<'a> {
    pub root: &'a Path,
    pub files: Vec<String>,
}

/// Write a listing to `out` in the requested format.
///
/// - `Compact`: one relative path per line; an empty root prints nothing.
/// - `Json`: a single pretty-printed `{"root", "files"}` object.
pub fn write_listing<W: Write>(
    out: &mut W,
    root: &Path,
    files: impl IntoIterator<Item = PathBuf>,
    format: &OutputFormat,
) -> io::Result<()> {
    let files = files
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned());

    match format {
        OutputFormat::Compact => {
            for file in files {
                writeln!(out, "{file}")?;
            }
        }
        OutputFormat::Json => {
            let body = FindOutput {
                root,
                files: files.collect(),
            };
            serde_json::to_writer_pretty(&mut *out, &body)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
