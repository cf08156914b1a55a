//! The process lock file.
//!
//! A running storage owns `used.lock` in its base directory. The file holds
//! `<lastWriteMs>;<expirationMs>;<identifier>` and is rewritten by a
//! heartbeat thread every update interval. Another process may take the
//! storage over only with the same identifier or once the lock is long
//! expired, i.e. more than one interval past its expiration time.
//!
//! On local files an advisory exclusive lock is held as well.

use crate::config::LockFileConfig;
use crate::controller::OperationController;
use crate::error::{CoreError, CoreResult};
use crate::types::now_millis;
use parking_lot::{Condvar, Mutex};
use shardstore_storage::FileSystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parsed content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFileContent {
    /// When the owner last wrote the file, in milliseconds since the epoch.
    pub last_write_ms: i64,
    /// When the lock expires unless rewritten.
    pub expiration_ms: i64,
    /// The owner.
    pub identifier: String,
}

impl LockFileContent {
    /// Parses `<lastWriteMs>;<expirationMs>;<identifier>`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().splitn(3, ';');
        let last_write_ms = parts.next()?.parse().ok()?;
        let expiration_ms = parts.next()?.parse().ok()?;
        let identifier = parts.next()?.to_owned();
        Some(Self {
            last_write_ms,
            expiration_ms,
            identifier,
        })
    }

    /// Formats the content as written to disk.
    #[must_use]
    pub fn render(&self) -> String {
        format!("{};{};{}", self.last_write_ms, self.expiration_ms, self.identifier)
    }

    fn is_long_expired(&self, now_ms: i64, interval: Duration) -> bool {
        now_ms > self.expiration_ms.saturating_add(millis(interval))
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug)]
struct LockShared {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    identifier: String,
    interval: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl LockShared {
    fn write(&self) -> CoreResult<()> {
        let now = now_millis();
        let content = LockFileContent {
            last_write_ms: now,
            expiration_ms: now.saturating_add(millis(self.interval)),
            identifier: self.identifier.clone(),
        };
        self.fs.write_all(&self.path, content.render().as_bytes())?;
        Ok(())
    }

    /// The identifier of an owner that keeps us out, if any.
    fn blocking_owner(&self) -> CoreResult<Option<String>> {
        if !self.fs.exists(&self.path) {
            return Ok(None);
        }
        let data = self.fs.read_all(&self.path)?;
        let text = String::from_utf8_lossy(&data);
        let Some(content) = LockFileContent::parse(&text) else {
            warn!(file = %self.path.display(), "unreadable lock file, taking over");
            return Ok(None);
        };
        if content.identifier == self.identifier {
            debug!(owner = %content.identifier, "lock file owned by this process");
            return Ok(None);
        }
        if content.is_long_expired(now_millis(), self.interval) {
            info!(owner = %content.identifier, "taking over expired lock file");
            return Ok(None);
        }
        Ok(Some(content.identifier))
    }
}

/// Owns the lock file while the storage runs.
#[derive(Debug)]
pub struct LockFileManager {
    shared: Arc<LockShared>,
    thread: Option<JoinHandle<()>>,
    #[cfg(feature = "std")]
    os_lock: Option<std::fs::File>,
}

impl LockFileManager {
    /// Takes the lock file at `path` and starts the heartbeat thread.
    ///
    /// With `advisory` set, `path` is a local file and an exclusive
    /// advisory lock is taken on it as well. A failing heartbeat disrupts
    /// `controller`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StorageLocked`] if another owner still holds
    /// the lock after one wait of the update interval.
    pub fn acquire(
        fs: Arc<dyn FileSystem>,
        path: &Path,
        config: &LockFileConfig,
        advisory: bool,
        controller: Arc<OperationController>,
    ) -> CoreResult<Self> {
        let identifier = config
            .identifier
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let shared = Arc::new(LockShared {
            fs,
            path: path.to_path_buf(),
            identifier,
            interval: config.update_interval,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        if let Some(owner) = shared.blocking_owner()? {
            info!(owner = %owner, "storage locked, waiting once");
            thread::sleep(shared.interval);
            if let Some(owner) = shared.blocking_owner()? {
                return Err(CoreError::StorageLocked { owner });
            }
        }

        if let Some(parent) = path.parent() {
            shared.fs.create_dir_all(parent)?;
        }
        #[cfg(feature = "std")]
        let os_lock = if advisory { Some(lock_os_file(path)?) } else { None };
        #[cfg(not(feature = "std"))]
        let _ = advisory;

        shared.write()?;
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("shardstore-lock".into())
                .spawn(move || heartbeat(&shared, &controller))?
        };
        info!(owner = %shared.identifier, file = %path.display(), "lock file acquired");
        Ok(Self {
            shared,
            thread: Some(thread),
            #[cfg(feature = "std")]
            os_lock,
        })
    }

    /// The identifier written to the lock file.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// Stops the heartbeat and removes the lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub fn release(&mut self) -> CoreResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if thread.join().is_err() {
            warn!("lock heartbeat thread panicked");
        }
        let result = match self.shared.fs.delete(&self.shared.path) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        #[cfg(feature = "std")]
        if let Some(file) = self.os_lock.take() {
            use fs2::FileExt;
            file.unlock()?;
        }
        debug!(owner = %self.shared.identifier, "lock file released");
        Ok(result?)
    }
}

impl Drop for LockFileManager {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release lock file");
        }
    }
}

#[cfg(feature = "std")]
fn lock_os_file(path: &Path) -> CoreResult<std::fs::File> {
    use fs2::FileExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(CoreError::StorageLocked {
            owner: "another process".into(),
        });
    }
    Ok(file)
}

fn heartbeat(shared: &LockShared, controller: &OperationController) {
    let mut stopped = shared.stopped.lock();
    while !*stopped {
        shared.wake.wait_for(&mut stopped, shared.interval);
        if *stopped {
            break;
        }
        if let Err(e) = shared.write() {
            error!(error = %e, "lock file update failed");
            controller.register_disruption(Arc::new(e));
            break;
        }
    }
}
