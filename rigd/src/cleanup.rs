//! Out-of-band scratch-directory cleanup.
//!
//! Every environment registers its scratch directory here while it is
//! alive. Normal teardown removes the directory and unregisters it; if
//! the daemon dies to a signal instead, the signal handler drains the
//! registry so crashed runs do not leak temp trees.

use std::collections::BTreeSet;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;

static REGISTERED: Lazy<Mutex<BTreeSet<Utf8PathBuf>>> = Lazy::new(Default::default);

pub fn register(path: &Utf8Path) {
    REGISTERED.lock().unwrap().insert(path.to_owned());
}

pub fn unregister(path: &Utf8Path) {
    REGISTERED.lock().unwrap().remove(path);
}

/// Remove every still-registered directory. Idempotent; safe to call from
/// the shutdown path and from signal handling.
pub fn run() {
    let paths = std::mem::take(&mut *REGISTERED.lock().unwrap());
    for path in paths {
        if let Err(e) = std::fs::remove_dir_all(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to clean up {path}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_removes_registered_dirs_once() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("env-x");
        std::fs::create_dir_all(&target).unwrap();

        register(&target);
        run();
        assert!(!target.exists());

        // Second run is a no-op.
        run();
    }
}
