//! Content-addressed replay cache with single-flight execution

use crate::fingerprint::{canonical_json, fingerprint, sha256_hex};
use crate::tools::{CacheStatus, ErrorCode, HandlerOutput, ToolDefinition, ToolError};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Replay cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Consult and fill the cache at all
    pub enabled: bool,

    /// Entry lifetime (none = until evicted)
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Maximum number of entries; the oldest is evicted first
    pub max_entries: usize,

    /// Re-execute on every hit and compare fingerprints
    pub verify_hits: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
            max_entries: 1024,
            verify_hits: false,
        }
    }
}

/// Cache key for an invocation: SHA-256 of canonical `{tool, version, input}`
pub fn replay_key(tool: &str, version: &Version, input: &Value) -> String {
    sha256_hex(canonical_json(&json!({
        "tool": tool,
        "version": version.to_string(),
        "input": input,
    })))
}

/// A cached result
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    /// The stored value
    pub value: Value,
    /// Its fingerprint
    pub fingerprint: String,
}

/// What a `store` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New entry written
    Inserted,
    /// An identical entry was already present
    Unchanged,
}

/// Result served by [`ReplayCache::execute`]
#[derive(Debug, Clone)]
pub struct Replayed {
    /// Handler output (cost is only meaningful for `Miss`)
    pub output: HandlerOutput,
    /// How the result was obtained
    pub status: CacheStatus,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Results currently cached
    pub entries: usize,
    /// Calls served from a cached result
    pub hits: u64,
    /// Calls that ran the handler
    pub misses: u64,
    /// Calls that waited on an in-flight execution for the same key
    pub coalesced: u64,
    /// Re-executions that disagreed with the cached fingerprint
    pub mismatches: u64,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    fingerprint: String,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, Entry>,
    by_age: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Entries {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.by_key.remove(key) {
            self.by_age.remove(&entry.seq);
        }
    }
}

type Flight = Shared<BoxFuture<'static, Result<HandlerOutput, ToolError>>>;

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    mismatches: AtomicU64,
}

struct Inner {
    config: ReplayConfig,
    entries: Mutex<Entries>,
    inflight: Mutex<HashMap<String, Flight>>,
    counters: Counters,
}

/// Memoizes results of pure tools by content.
///
/// Concurrent requests for the same unresolved key share one execution.
/// The execution runs on its own task, so a caller that gives up waiting
/// never cancels it for the others. Cheap to clone.
#[derive(Clone)]
pub struct ReplayCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCache")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(ReplayConfig::default())
    }
}

/// Removes the in-flight entry when the shared execution ends, even if it panics
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl ReplayCache {
    /// Create a cache
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(Entries::default()),
                inflight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &ReplayConfig {
        &self.inner.config
    }

    /// Whether invocations of `definition` may use the cache at all
    pub fn is_eligible(&self, definition: &ToolDefinition) -> bool {
        self.inner.config.enabled && definition.is_pure()
    }

    /// Whether a result of `definition` may be stored
    pub fn is_cacheable(&self, definition: &ToolDefinition, value: &Value) -> bool {
        self.is_eligible(definition) && fits(value, definition.max_output_bytes)
    }

    /// Look up a live entry
    pub fn lookup(&self, key: &str) -> Option<CachedResult> {
        let mut entries = self.entries();
        let expired = match entries.by_key.get(key) {
            None => return None,
            Some(entry) => self.is_expired(entry),
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.by_key.get(key).map(|entry| CachedResult {
            value: entry.value.clone(),
            fingerprint: entry.fingerprint.clone(),
        })
    }

    /// Store a result.
    ///
    /// Storing a value that differs from the live entry for the same key is a
    /// `REPLAY_HASH_MISMATCH`: the tool claimed to be pure but is not. The
    /// existing entry is kept.
    pub fn store(&self, key: &str, value: Value) -> Result<StoreOutcome, ToolError> {
        let new_fingerprint = fingerprint(&value);
        let mut entries = self.entries();

        if let Some(existing) = entries.by_key.get(key) {
            if self.is_expired(existing) {
                entries.remove(key);
            } else if existing.fingerprint == new_fingerprint {
                return Ok(StoreOutcome::Unchanged);
            } else {
                let cached = existing.fingerprint.clone();
                drop(entries);
                return Err(self.mismatch(key, &cached, &new_fingerprint));
            }
        }

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.by_age.insert(seq, key.to_string());
        entries.by_key.insert(
            key.to_string(),
            Entry {
                value,
                fingerprint: new_fingerprint,
                inserted_at: Instant::now(),
                seq,
            },
        );

        let max = self.inner.config.max_entries.max(1);
        while entries.by_key.len() > max {
            let Some((_, oldest)) = entries.by_age.pop_first() else {
                break;
            };
            entries.by_key.remove(&oldest);
            tracing::debug!(key = %oldest, "Evicted replay entry");
        }
        Ok(StoreOutcome::Inserted)
    }

    /// Drop every entry
    pub fn clear(&self) {
        *self.entries() = Entries::default();
    }

    /// Number of stored entries (including expired ones not yet purged)
    pub fn len(&self) -> usize {
        self.entries().by_key.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters
    pub fn stats(&self) -> ReplayStats {
        let c = &self.inner.counters;
        ReplayStats {
            entries: self.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            mismatches: c.mismatches.load(Ordering::Relaxed),
        }
    }

    /// Serve `key` from the cache, joining an in-flight execution, or run
    /// `work` once on a spawned task and store its output if it is at most
    /// `max_output_bytes`.
    ///
    /// With `verify_hits`, a hit re-runs `work` inline and fails with
    /// `REPLAY_HASH_MISMATCH` if the fresh result differs.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        max_output_bytes: usize,
        work: F,
    ) -> Result<Replayed, ToolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<HandlerOutput, ToolError>> + Send + 'static,
    {
        if let Some(cached) = self.lookup(key) {
            return self.serve_hit(key, cached, work).await;
        }

        let mut work = Some(work);
        let plan = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(flight) = inflight.get(key) {
                Ok((flight.clone(), CacheStatus::Coalesced))
            } else if let Some(cached) = self.lookup(key) {
                // Filled between the first lookup and taking the lock
                Err(cached)
            } else if let Some(work) = work.take() {
                let flight = self.spawn_flight(key, max_output_bytes, work);
                inflight.insert(key.to_string(), flight.clone());
                Ok((flight, CacheStatus::Miss))
            } else {
                return Err(ToolError::internal("Replay work already consumed"));
            }
        };

        let (flight, status) = match plan {
            Ok(plan) => plan,
            Err(cached) => match work.take() {
                Some(work) => return self.serve_hit(key, cached, work).await,
                None => return Err(ToolError::internal("Replay work already consumed")),
            },
        };

        match status {
            CacheStatus::Coalesced => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "Joined in-flight execution");
            }
            _ => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        let output = flight.await?;
        Ok(Replayed { output, status })
    }

    fn spawn_flight<F, Fut>(&self, key: &str, max_output_bytes: usize, work: F) -> Flight
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<HandlerOutput, ToolError>> + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        let guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let output = work().await?;
            if fits(&output.value, max_output_bytes) {
                cache.store(&key, output.value.clone())?;
            } else {
                tracing::debug!(key = %key, "Result too large to cache");
            }
            Ok(output)
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(ToolError::internal(format!("Cached execution aborted: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    async fn serve_hit<F, Fut>(
        &self,
        key: &str,
        cached: CachedResult,
        work: F,
    ) -> Result<Replayed, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutput, ToolError>>,
    {
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, "Replay cache hit");

        if self.inner.config.verify_hits {
            let fresh = work().await?;
            let fresh_fingerprint = fingerprint(&fresh.value);
            if fresh_fingerprint != cached.fingerprint {
                return Err(self.mismatch(key, &cached.fingerprint, &fresh_fingerprint));
            }
        }

        Ok(Replayed {
            output: HandlerOutput::new(cached.value),
            status: CacheStatus::Hit,
        })
    }

    fn mismatch(&self, key: &str, cached: &str, fresh: &str) -> ToolError {
        self.inner.counters.mismatches.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(key, cached, fresh, "Replay hash mismatch");
        ToolError::new(
            ErrorCode::ReplayHashMismatch,
            "A pure tool produced a different result for identical input",
        )
        .with_context(json!({
            "key": key,
            "cached_fingerprint": cached,
            "fresh_fingerprint": fresh,
        }))
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        self.inner
            .config
            .ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn fits(value: &Value, max_bytes: usize) -> bool {
    serde_json::to_vec(value).is_ok_and(|bytes| bytes.len() <= max_bytes)
}
