use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace};

use crate::error::{Result, WatchError};

#[derive(Default)]
struct Pending {
    waiters: HashMap<OsString, oneshot::Sender<()>>,
    /// Set once the root is going away; no new waiters are accepted.
    closed: bool,
}

/// The settle barrier for one root.
///
/// A query drops a uniquely named cookie file into the root and waits until the
/// reconciler reports that the cookie's event went through. Notifications for a
/// root are delivered in order, so by then every earlier change has been applied.
pub struct CookieJar {
    prefix: String,
    serial: AtomicU64,
    pending: Mutex<Pending>,
}

impl CookieJar {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
            serial: AtomicU64::new(0),
            pending: Mutex::new(Pending::default()),
        }
    }

    fn next_name(&self) -> OsString {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}-{}", self.prefix, std::process::id(), serial).into()
    }

    /// Serial of the most recently named cookie. Any cookie named later has a
    /// larger serial, and its file is written after this call returns.
    pub fn issued(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }

    /// Serial encoded in one of this process's cookie names.
    pub fn serial_of(&self, rel: &Path) -> Option<u64> {
        let name = rel.file_name()?.to_str()?;
        let (pid, serial) = name.strip_prefix(&self.prefix)?.split_once('-')?;
        if pid.parse::<u32>().ok()? != std::process::id() {
            return None;
        }
        serial.parse().ok()
    }

    /// Wake the query waiting on the cookie at `rel`, if any.
    ///
    /// Must only be called after every event preceding the cookie's has been applied.
    pub async fn observe(&self, rel: &Path) -> bool {
        let Some(name) = rel.file_name() else {
            return false;
        };
        let waiter = self.pending.lock().await.waiters.remove(name);
        match waiter {
            Some(tx) => {
                trace!("cookie {} observed", rel.display());
                // The waiter may have timed out already.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Names of the cookies currently being waited on.
    pub async fn pending_names(&self) -> Vec<OsString> {
        self.pending.lock().await.waiters.keys().cloned().collect()
    }

    /// Wake the given cookies regardless of whether their events were seen.
    ///
    /// Used after a recrawl that started once these cookies were registered.
    pub async fn release(&self, names: &[OsString]) -> usize {
        let mut pending = self.pending.lock().await;
        let mut released = 0;
        for name in names {
            if let Some(tx) = pending.waiters.remove(name) {
                let _ = tx.send(());
                released += 1;
            }
        }
        released
    }

    /// Fail every waiter with `RootRemoved` and refuse new ones.
    pub async fn abandon_all(&self) {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        pending.waiters.clear();
    }

    /// Block until every change made to `root` before this call is in the index,
    /// or until `timeout` elapses.
    pub async fn sync(&self, root: &Path, timeout: Duration) -> Result<()> {
        let name = self.next_name();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(WatchError::RootRemoved(root.to_path_buf()));
            }
            pending.waiters.insert(name.clone(), tx);
        }

        let cookie_path = root.join(&name);
        if let Err(err) = tokio::fs::write(&cookie_path, b"").await {
            self.pending.lock().await.waiters.remove(&name);
            return Err(WatchError::Io(err));
        }

        let outcome = tokio::time::timeout(timeout, rx).await;

        self.pending.lock().await.waiters.remove(&name);
        if let Err(err) = tokio::fs::remove_file(&cookie_path).await
            && err.kind() != ErrorKind::NotFound
        {
            debug!("failed to remove cookie {}: {err}", cookie_path.display());
        }

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(WatchError::RootRemoved(root.to_path_buf())),
            Err(_) => Err(WatchError::SettleTimeout {
                root: root.to_path_buf(),
                waited: timeout,
            }),
        }
    }
}
