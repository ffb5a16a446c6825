//! Artifact resolution: producing the binaries and images services need
//! before anything starts, against a cache shared by concurrent
//! environments and daemons.

pub mod build;
pub mod image;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use rig_api::events::{Event, EventType};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::backoff;

use crate::cache::{ArtifactCache, CacheKey};
use crate::eventlog::EventLog;

/// What a resolver leaves behind: an optional path on disk (compiled
/// binaries) and free-form metadata (image ids, binary names).
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub path: Option<Utf8PathBuf>,
    pub meta: BTreeMap<String, String>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn cache_key(&self) -> CacheKey;

    /// Look for a previously produced output in the cache entry.
    async fn cached(&self, output_dir: &Utf8Path) -> anyhow::Result<Option<Output>>;

    /// Produce the output into the cache entry. Only ever called under
    /// the entry's file lock.
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        output_dir: &Utf8Path,
    ) -> anyhow::Result<Output>;

    /// Whether a failure is worth retrying (network flake) or
    /// deterministic (compile error).
    fn retryable(&self) -> bool;

    /// Re-check that a cache hit is still usable. Externally backed
    /// outputs can disappear behind the cache's back (a pruned image).
    async fn valid(&self, _output: &Output) -> bool {
        true
    }
}

/// An artifact request: the dedup key is chosen by the service type, so
/// two services asking for the same binary share one resolution.
pub struct Artifact {
    pub key: String,
    pub resolver: Arc<dyn Resolver>,
}

/// Retry budget for retryable resolvers: three attempts, backing off
/// 1s then 2s.
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BASE_BACKOFF_SECONDS: f64 = 1.0;
const RETRY_MAX_BACKOFF_SECONDS: f64 = 2.0;

struct ResolveFailure {
    key: String,
    error: anyhow::Error,
    cancelled: bool,
}

/// Resolve every artifact, deduplicated by key, and return the outputs.
///
/// Cache hits are taken without the lock first; misses go through a
/// per-entry file lock with a re-check, so concurrent daemons do the work
/// exactly once. The first failure cancels `cancel` (and with it the
/// whole environment); sibling failures caused by that cancellation are
/// swallowed.
pub async fn resolve_all(
    cancel: &CancellationToken,
    log: &Arc<EventLog>,
    cache: &Arc<ArtifactCache>,
    artifacts: Vec<Artifact>,
) -> anyhow::Result<HashMap<String, Output>> {
    let mut deduped: Vec<Artifact> = Vec::new();
    for artifact in artifacts {
        if !deduped.iter().any(|a| a.key == artifact.key) {
            deduped.push(artifact);
        }
    }

    let mut outputs = HashMap::new();
    let mut misses = Vec::new();
    for artifact in deduped {
        let cache_key = artifact.resolver.cache_key();
        let output_dir = cache.output_dir(&cache_key)?;
        match artifact.resolver.cached(&output_dir).await {
            Ok(Some(output)) if artifact.resolver.valid(&output).await => {
                info!("artifact {} cached at {cache_key}", artifact.key);
                log.publish(Event::new(EventType::ArtifactCached).with_artifact(&artifact.key));
                cache.touch_last_used(&cache_key);
                outputs.insert(artifact.key, output);
            }
            Ok(_) => misses.push(artifact),
            Err(e) => {
                warn!("cache probe for {} failed, re-resolving: {e:#}", artifact.key);
                misses.push(artifact);
            }
        }
    }

    let mut workers = JoinSet::new();
    for artifact in misses {
        let cancel = cancel.clone();
        let log = Arc::clone(log);
        let cache = Arc::clone(cache);
        workers.spawn(async move {
            resolve_one(&cancel, &log, &cache, &artifact)
                .await
                .map(|output| (artifact.key.clone(), output))
                .map_err(|error| {
                    let cancelled = cancel.is_cancelled();
                    // First failure wins: everything else in the
                    // environment stops now.
                    cancel.cancel();
                    ResolveFailure {
                        key: artifact.key,
                        error,
                        cancelled,
                    }
                })
        });
    }

    let mut first_failure: Option<ResolveFailure> = None;
    while let Some(joined) = workers.join_next().await {
        match joined.expect("artifact worker panicked") {
            Ok((key, output)) => {
                outputs.insert(key, output);
            }
            Err(failure) => {
                let replace = match &first_failure {
                    None => true,
                    // A real error beats a cancellation side effect.
                    Some(current) => current.cancelled && !failure.cancelled,
                };
                if replace {
                    first_failure = Some(failure);
                }
            }
        }
    }

    match first_failure {
        None => Ok(outputs),
        Some(failure) => Err(failure
            .error
            .context(format!("failed to resolve artifact {}", failure.key))),
    }
}

async fn resolve_one(
    cancel: &CancellationToken,
    log: &EventLog,
    cache: &ArtifactCache,
    artifact: &Artifact,
) -> anyhow::Result<Output> {
    let cache_key = artifact.resolver.cache_key();
    let output_dir = cache.output_dir(&cache_key)?;

    let _lock = cache.lock(&cache_key).await?;

    // Someone else may have produced the entry while we queued on the
    // lock.
    if let Some(output) = artifact.resolver.cached(&output_dir).await? {
        if artifact.resolver.valid(&output).await {
            log.publish(Event::new(EventType::ArtifactCached).with_artifact(&artifact.key));
            cache.touch_last_used(&cache_key);
            return Ok(output);
        }
    }

    log.publish(Event::new(EventType::ArtifactStarted).with_artifact(&artifact.key));

    let attempts = if artifact.resolver.retryable() {
        RETRY_ATTEMPTS
    } else {
        1
    };
    let mut last_error = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = backoff::exponential_backoff(
                    attempt as u32,
                    RETRY_BASE_BACKOFF_SECONDS,
                    RETRY_MAX_BACKOFF_SECONDS,
                ) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        match artifact.resolver.resolve(cancel, &output_dir).await {
            Ok(output) => {
                log.publish(Event::new(EventType::ArtifactCompleted).with_artifact(&artifact.key));
                cache.touch_last_used(&cache_key);
                return Ok(output);
            }
            Err(e) => {
                warn!(
                    "artifact {} attempt {}/{attempts} failed: {e:#}",
                    artifact.key,
                    attempt + 1
                );
                last_error = Some(e);
            }
        }
    }

    let error = last_error.unwrap_or_else(|| anyhow::anyhow!("cancelled"));
    log.publish(
        Event::new(EventType::ArtifactFailed)
            .with_artifact(&artifact.key)
            .with_error(&error),
    );
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeResolver {
        name: &'static str,
        fail_first: usize,
        retryable: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        fn cache_key(&self) -> CacheKey {
            CacheKey::of("fake", self.name.as_bytes())
        }

        async fn cached(&self, output_dir: &Utf8Path) -> anyhow::Result<Option<Output>> {
            let marker = output_dir.join("done");
            if marker.exists() {
                Ok(Some(Output {
                    path: Some(marker),
                    meta: BTreeMap::new(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn resolve(
            &self,
            _cancel: &CancellationToken,
            output_dir: &Utf8Path,
        ) -> anyhow::Result<Output> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("transient failure {call}");
            }
            let marker = output_dir.join("done");
            std::fs::write(&marker, self.name)?;
            Ok(Output {
                path: Some(marker),
                meta: BTreeMap::new(),
            })
        }

        fn retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fixture() -> (Arc<EventLog>, Arc<ArtifactCache>, camino_tempfile::Utf8TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let cache = Arc::new(ArtifactCache::new(dir.path().join("cache")).unwrap());
        (EventLog::new("t"), cache, dir)
    }

    fn kinds(log: &EventLog) -> Vec<EventType> {
        log.events().iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn dedup_and_cache_hit_on_second_resolve() {
        let (log, cache, _dir) = fixture();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let make = |calls: &Arc<AtomicUsize>| Artifact {
            key: "bin:echo".to_string(),
            resolver: Arc::new(FakeResolver {
                name: "echo",
                fail_first: 0,
                retryable: false,
                calls: Arc::clone(calls),
            }),
        };

        // Two requests with the same key resolve once.
        let outputs = resolve_all(&cancel, &log, &cache, vec![make(&calls), make(&calls)])
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            kinds(&log),
            vec![EventType::ArtifactStarted, EventType::ArtifactCompleted]
        );

        // A later environment sees a cache hit without a resolve call.
        let log2 = EventLog::new("t2");
        let outputs = resolve_all(&cancel, &log2, &cache, vec![make(&calls)])
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kinds(&log2), vec![EventType::ArtifactCached]);
    }

    #[tokio::test]
    async fn retryable_resolver_gets_three_attempts() {
        let (log, cache, _dir) = fixture();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        tokio::time::pause();
        let fut = resolve_all(
            &cancel,
            &log,
            &cache,
            vec![Artifact {
                key: "img:x".to_string(),
                resolver: Arc::new(FakeResolver {
                    name: "x",
                    fail_first: 2,
                    retryable: true,
                    calls: Arc::clone(&calls),
                }),
            }],
        );
        let outputs = fut.await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_cancels_and_reports() {
        let (log, cache, _dir) = fixture();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let err = resolve_all(
            &cancel,
            &log,
            &cache,
            vec![Artifact {
                key: "bin:broken".to_string(),
                resolver: Arc::new(FakeResolver {
                    name: "broken",
                    fail_first: usize::MAX,
                    retryable: false,
                    calls: Arc::clone(&calls),
                }),
            }],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("bin:broken"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cancel.is_cancelled());
        assert!(kinds(&log).contains(&EventType::ArtifactFailed));
    }
}
