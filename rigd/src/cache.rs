//! Content-addressed artifact cache, shared by every environment and by
//! concurrent daemon processes. Each entry is a directory named by the
//! resolver family and key hash; an advisory file lock inside the entry
//! serializes resolution across processes.

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};
use utils::lock_file::{self, LockFileGuard};

pub const LAST_USED_FILE: &str = ".last-used";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Resolver family, used as the directory layer under the cache root
    /// ("cargo", "image", ...).
    pub family: &'static str,
    pub hash: String,
}

impl CacheKey {
    /// Hash arbitrary key material into a cache key.
    pub fn of(family: &'static str, material: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(material);
        CacheKey {
            family,
            hash: hex::encode(hasher.finalize()),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.family, self.hash)
    }
}

pub struct ArtifactCache {
    root: Utf8PathBuf,
}

impl ArtifactCache {
    pub fn new(root: Utf8PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(ArtifactCache { root })
    }

    /// The output directory for `key`, created if absent.
    pub fn output_dir(&self, key: &CacheKey) -> anyhow::Result<Utf8PathBuf> {
        let dir = self.root.join(key.family).join(&key.hash);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Take the per-entry exclusive lock. Blocks (off the async runtime)
    /// until any concurrent resolver, in this process or another daemon,
    /// finishes with the entry.
    pub async fn lock(&self, key: &CacheKey) -> anyhow::Result<LockFileGuard> {
        let lock_path = self.output_dir(key)?.join(LOCK_FILE);
        tokio::task::spawn_blocking(move || lock_file::lock_exclusive(&lock_path))
            .await
            .expect("lock task panicked")
    }

    /// Stamp the entry as recently used. Cache eviction tooling keys off
    /// this file; failures are not fatal to the resolution itself.
    pub fn touch_last_used(&self, key: &CacheKey) {
        if let Ok(dir) = self.output_dir(key) {
            let stamp = chrono::Utc::now().to_rfc3339();
            if let Err(e) = std::fs::write(dir.join(LAST_USED_FILE), stamp) {
                tracing::warn!("failed to update {LAST_USED_FILE} for {key}: {e}");
            }
        }
    }
}
