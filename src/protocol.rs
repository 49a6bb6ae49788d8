use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::WatchError;
use crate::manager::WatchManager;
use crate::query::QueryFilter;
use crate::tree::node::EntryKind;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Request decoding
// ---------------------------------------------------------------------------

/// The filter object accepted by `query`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuerySpec {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    path: PathList,
}

/// `"path"` may be a single relative path or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PathList {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl Default for PathList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl PathList {
    fn into_vec(self) -> Vec<PathBuf> {
        match self {
            Self::One(path) => vec![path],
            Self::Many(paths) => paths,
        }
    }
}

impl QuerySpec {
    fn into_filter(self) -> Result<QueryFilter> {
        let mut filter = QueryFilter::under(self.path.into_vec());
        if let Some(code) = self.kind {
            let kind = EntryKind::from_code(&code)
                .ok_or_else(|| anyhow!("invalid type '{code}', expected one of f, d, l"))?;
            filter = filter.with_kind(kind);
        }
        Ok(filter)
    }
}

fn root_arg<'a>(command: &str, args: &'a [Value]) -> Result<&'a Path> {
    let root = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("wrong number of arguments to '{command}'"))?;
    Ok(Path::new(root))
}

fn response(fields: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("version".to_owned(), json!(VERSION));
    body.extend(fields);
    Value::Object(body)
}

fn files(listing: impl Iterator<Item = PathBuf>) -> Value {
    Value::Array(
        listing
            .map(|p| Value::String(p.to_string_lossy().into_owned()))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execute one decoded command array.
pub async fn dispatch(manager: &WatchManager, request: &Value) -> Result<Value> {
    let items = request
        .as_array()
        .ok_or_else(|| anyhow!("invalid command (expected an array with some elements!)"))?;
    let (command, args) = items
        .split_first()
        .ok_or_else(|| anyhow!("invalid command (expected an array with some elements!)"))?;
    let command = command
        .as_str()
        .ok_or_else(|| anyhow!("invalid command: expected element 0 to be the command name"))?;

    let mut out = Map::new();
    match command {
        "version" => {}
        "watch" => {
            let handle = manager.watch(root_arg(command, args)?).await?;
            out.insert("watch".to_owned(), json!(handle.root));
            out.insert("watcher".to_owned(), json!("notify"));
            out.insert("new".to_owned(), json!(handle.newly_watched));
        }
        "watch-del" => {
            let root = root_arg(command, args)?;
            let removed = manager.watch_del(root).await;
            out.insert("watch-del".to_owned(), json!(removed));
            out.insert("root".to_owned(), json!(root));
        }
        "watch-list" => {
            out.insert("roots".to_owned(), json!(manager.watch_list().await));
        }
        "is-watched" => {
            let watched = manager.is_watched(root_arg(command, args)?).await;
            out.insert("is-watched".to_owned(), json!(watched));
        }
        "find" => {
            let root = root_arg(command, args)?;
            let under = args[1..]
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow!("find: patterns must be strings"))
                })
                .collect::<Result<Vec<_>>>()?;
            let listing = manager.find(root, &under).await?;
            out.insert("files".to_owned(), files(listing));
        }
        "query" => {
            let root = root_arg(command, args)?;
            let filter = match args.get(1) {
                Some(spec) => serde_json::from_value::<QuerySpec>(spec.clone())
                    .context("invalid query specification")?
                    .into_filter()?,
                None => QueryFilter::all(),
            };
            let listing = manager.query(root, &filter).await?;
            out.insert("files".to_owned(), files(listing));
        }
        "status" => {
            let status = manager.status(root_arg(command, args)?).await?;
            out.insert("root".to_owned(), json!(status.root));
            out.insert("state".to_owned(), json!(status.state.as_str()));
            out.insert("entries".to_owned(), json!(status.entries));
            out.insert("last_seq".to_owned(), json!(status.last_seq));
            out.insert("recrawls".to_owned(), json!(status.recrawls));
            let created = status
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            out.insert("created".to_owned(), json!(created));
        }
        "debug-recrawl" => {
            manager.debug_recrawl(root_arg(command, args)?).await?;
            out.insert("recrawl".to_owned(), json!(true));
        }
        other => bail!("unknown command {other}"),
    }

    Ok(response(out))
}

/// Decode and execute one request line. Failures become an `error` response.
pub async fn handle_line(manager: &WatchManager, line: &str) -> Value {
    let outcome = match serde_json::from_str::<Value>(line) {
        Ok(request) => dispatch(manager, &request).await,
        Err(err) => Err(anyhow!("invalid json: {err}")),
    };

    outcome.unwrap_or_else(|err| {
        debug!("request failed: {err:#}");
        let mut out = Map::new();
        out.insert("error".to_owned(), json!(format!("{err:#}")));
        if err
            .downcast_ref::<WatchError>()
            .is_some_and(WatchError::is_retryable)
        {
            out.insert("retryable".to_owned(), json!(true));
        }
        response(out)
    })
}

/// Answer newline-delimited JSON requests until the reader is exhausted.
pub async fn serve<R, W>(manager: &WatchManager, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(manager, &line).await;
        let mut encoded = serde_json::to_vec(&reply)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    Ok(())
}
