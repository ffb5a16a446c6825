//! Advisory file locking.
//!
//! Both the daemon singleton (`rigd.lock`) and the artifact cache (one
//! `.lock` per cache entry) use the same discipline: open-or-create the
//! file, take an exclusive `flock`, and hold the open descriptor for as
//! long as the critical section lasts. The lock dies with the process, so
//! a crashed holder never wedges its peers.

use std::fs::{File, OpenOptions};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;

/// Holds the exclusive lock for as long as it is alive. Dropping the guard
/// releases the lock; the file itself is left in place for the next taker.
pub struct LockFileGuard {
    file: File,
    path: Utf8PathBuf,
}

impl LockFileGuard {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Overwrite the locked file's content. Useful for lock files that
    /// double as breadcrumbs (e.g. recording the owner pid).
    pub fn write_content(&mut self, content: &str) -> anyhow::Result<()> {
        use std::io::{Seek, Write};
        self.file.set_len(0)?;
        self.file.rewind()?;
        self.file.write_all(content.as_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("failed to unlock {}: {e}", self.path);
        }
    }
}

fn open(path: &Utf8Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock file {path}"))
}

/// Block until the exclusive lock on `path` can be taken.
///
/// The wait happens on the calling thread; from async code, call this via
/// `spawn_blocking`.
pub fn lock_exclusive(path: &Utf8Path) -> anyhow::Result<LockFileGuard> {
    let file = open(path)?;
    file.lock_exclusive()
        .with_context(|| format!("lock {path}"))?;
    Ok(LockFileGuard {
        file,
        path: path.to_owned(),
    })
}

/// Take the exclusive lock on `path` if it is free, without blocking.
/// Returns `None` when another process holds it.
pub fn try_lock_exclusive(path: &Utf8Path) -> anyhow::Result<Option<LockFileGuard>> {
    let file = open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockFileGuard {
            file,
            path: path.to_owned(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e).with_context(|| format!("try-lock {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_within_process() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let guard = try_lock_exclusive(&path).unwrap();
        assert!(guard.is_some());

        // fs2 locks are per file descriptor, so a second open in the same
        // process still observes the conflict.
        let second = try_lock_exclusive(&path).unwrap();
        assert!(second.is_none());

        drop(guard);
        let third = try_lock_exclusive(&path).unwrap();
        assert!(third.is_some());
    }
}
