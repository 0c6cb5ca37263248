//! Non-blocking advisory locks on individual uploads.
//!
//! A lock is an exclusive `flock` on `<id>.lock`, held for as long as the
//! manager keeps the file open. The holder's PID is written into the file
//! for operators. When the holding process dies the kernel drops the flock,
//! so a lock file left behind by a crashed process is simply reclaimed by
//! the next caller.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use mdf_config::{log_lock_debug, log_lock_warn};

use crate::paths::{file_path, LOCK_EXT};
use crate::{Result, StoreError};

/// Attempts before giving up when the lock file keeps being replaced
/// underneath us
const MAX_LOCK_ATTEMPTS: usize = 3;

/// Per-upload lock files under one upload root.
///
/// Locks held through this manager are released when it is dropped.
#[derive(Debug)]
pub struct LockManager {
    root: PathBuf,
    held: Mutex<HashMap<String, File>>,
}

impl LockManager {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        file_path(&self.root, id, LOCK_EXT)
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, File>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock for `id` without waiting.
    ///
    /// Fails with [`StoreError::LockBusy`] if anyone holds it, including
    /// this manager.
    pub fn try_lock(&self, id: &str) -> Result<()> {
        let mut held = self.held();
        if held.contains_key(id) {
            return Err(StoreError::LockBusy { id: id.to_string() });
        }

        let path = self.path(id);
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StoreError::from_create(e, &self.root, id))?;

            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(StoreError::LockBusy { id: id.to_string() });
                }
                Err(e) => return Err(e.into()),
            }

            // The previous holder may have unlinked the file between our
            // open and flock; then we locked an orphaned inode.
            if !is_same_file(&file, &path)? {
                log_lock_debug!("Lock file replaced while locking, retrying", id = id);
                continue;
            }

            if let Some(previous) = read_owner(&mut file)? {
                if previous != std::process::id() {
                    log_lock_warn!("Reclaimed stale lock", id = id, previous_pid = previous);
                }
            }
            write_owner(&mut file)?;

            held.insert(id.to_string(), file);
            log_lock_debug!("Lock acquired", id = id);
            return Ok(());
        }

        Err(StoreError::LockBusy { id: id.to_string() })
    }

    /// Release the lock for `id` and remove its lock file.
    ///
    /// A missing lock file means the upload was never locked and is not an
    /// error. A leftover file nobody holds is cleaned up. A lock held by
    /// someone else is left alone and reported as
    /// [`StoreError::LockNotOwned`].
    pub fn unlock(&self, id: &str) -> Result<()> {
        let path = self.path(id);

        if let Some(file) = self.held().remove(id) {
            remove_if_exists(&path)?;
            FileExt::unlock(&file)?;
            log_lock_debug!("Lock released", id = id);
            return Ok(());
        }

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                remove_if_exists(&path)?;
                FileExt::unlock(&file)?;
                log_lock_debug!("Removed stale lock file", id = id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(StoreError::LockNotOwned { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether some holder, in this process or another, owns the lock.
    pub fn is_locked(&self, id: &str) -> Result<bool> {
        if self.held().contains_key(id) {
            return Ok(true);
        }

        let file = match File::open(self.path(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                FileExt::unlock(&file)?;
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether this manager holds the lock for `id`
    pub fn holds(&self, id: &str) -> bool {
        self.held().contains_key(id)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        let held = self.held.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, file) in held.drain() {
            let _ = fs::remove_file(file_path(&self.root, &id, LOCK_EXT));
            drop(file);
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

fn read_owner(file: &mut File) -> io::Result<Option<u32>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;
    Ok(contents.trim().parse().ok())
}

fn write_owner(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}
