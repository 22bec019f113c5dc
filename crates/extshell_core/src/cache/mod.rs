//! Asset cache.
//!
//! # Responsibility
//! - Serve handles to fetched resources, fetching each key at most once at a
//!   time.
//! - Retry transient failures with capped exponential backoff and enforce a
//!   per-attempt timeout.
//! - Keep resident size bounded with batched least-recently-used eviction.
//!
//! # Invariants
//! - `resident_bytes` always equals the summed size of resident entries.
//! - Concurrent `get` calls for one key share a single in-flight fetch and
//!   observe the same outcome.
//! - Every entry leaving the cache is released through the fetcher that
//!   produced it.
//! - Expired entries are never served; they count as a miss.
//! - A cancelled fetch never populates the cache.

mod entry;
mod error;
mod fetch;

pub use entry::AssetHandle;
pub use error::{AssetFetchError, AssetResult};
pub use fetch::{AssetFetcher, FetchFailure, FetchOptions};

use crate::config::AssetCacheConfig;
use crate::events::{EventBus, EventKind};
use entry::AssetCacheEntry;
use fetch::{fetch_with_retry, Backoff};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type SharedFetch = Shared<BoxFuture<'static, AssetResult<AssetHandle>>>;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub resident_bytes: u64,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Deduplicating, size-bounded cache of fetched assets.
///
/// Cloning is cheap and all clones share one store.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: AssetCacheConfig,
    fetcher: Arc<dyn AssetFetcher>,
    events: EventBus,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, AssetCacheEntry>,
    resident_bytes: u64,
    in_flight: HashMap<String, InFlightFetch>,
    eviction_scheduled: bool,
    access_seq: u64,
    next_fetch_id: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct InFlightFetch {
    id: u64,
    cancel: CancellationToken,
    fetch: SharedFetch,
}

impl AssetCache {
    pub fn new(config: AssetCacheConfig, fetcher: Arc<dyn AssetFetcher>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                fetcher,
                events,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Request options derived from the cache configuration.
    pub fn default_options(&self) -> FetchOptions {
        FetchOptions::from_config(&self.inner.config)
    }

    /// Returns the handle for `key`, fetching it with the default fetcher on
    /// a miss.
    pub async fn get(&self, key: &str, options: &FetchOptions) -> AssetResult<AssetHandle> {
        let fetcher = Arc::clone(&self.inner.fetcher);
        self.get_with(key, fetcher, options).await
    }

    /// Like `get`, with a caller-supplied fetcher for this key.
    ///
    /// When a fetch for `key` is already in flight, the caller joins it and
    /// `fetcher` and `options` are ignored.
    pub async fn get_with(
        &self,
        key: &str,
        fetcher: Arc<dyn AssetFetcher>,
        options: &FetchOptions,
    ) -> AssetResult<AssetHandle> {
        let mut expired = None;
        let fetch = {
            let mut state = self.inner.lock_state();
            let now = Instant::now();
            let seq = state.next_access_seq();

            let fresh = match state.entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(now, seq);
                    Some(entry.handle.clone())
                }
                _ => None,
            };
            if let Some(handle) = fresh {
                state.hits += 1;
                debug!("event=asset_get module=cache status=hit key={key}");
                return Ok(handle);
            }
            if state.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
                expired = state.remove_entry(key);
            }
            state.misses += 1;

            match state.in_flight.get(key) {
                Some(existing) => {
                    debug!("event=asset_get module=cache status=joined key={key}");
                    existing.fetch.clone()
                }
                None => {
                    let id = state.next_fetch_id;
                    state.next_fetch_id += 1;
                    let cancel = CancellationToken::new();
                    let fetch = Arc::clone(&self.inner).spawn_fetch(
                        key.to_string(),
                        fetcher,
                        *options,
                        cancel.clone(),
                        id,
                    );
                    state.in_flight.insert(
                        key.to_string(),
                        InFlightFetch {
                            id,
                            cancel,
                            fetch: fetch.clone(),
                        },
                    );
                    debug!("event=asset_get module=cache status=miss key={key}");
                    fetch
                }
            }
        };
        if let Some(entry) = expired {
            debug!("event=asset_expire module=cache status=ok key={key}");
            entry.release();
        }
        fetch.await
    }

    /// Returns whether a fresh entry for `key` is resident. Does not count as
    /// an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock_state()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Drops the entry for `key`. Returns `false` when nothing was resident.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.lock_state().remove_entry(key);
        match removed {
            Some(entry) => {
                entry.release();
                self.inner.events.emit(EventKind::Invalidated, key, None);
                debug!("event=asset_invalidate module=cache status=ok key={key}");
                true
            }
            None => false,
        }
    }

    /// Drops every resident entry. In-flight fetches are left alone.
    pub fn invalidate_all(&self) -> usize {
        let removed: Vec<AssetCacheEntry> = {
            let mut state = self.inner.lock_state();
            state.resident_bytes = 0;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &removed {
            entry.release();
            self.inner
                .events
                .emit(EventKind::Invalidated, entry.handle.key(), None);
        }
        info!(
            "event=asset_invalidate_all module=cache status=ok removed={}",
            removed.len()
        );
        removed.len()
    }

    /// Cancels the in-flight fetch for `key`.
    ///
    /// Every waiter receives `Cancelled`; the next `get` starts a new fetch.
    pub fn cancel(&self, key: &str) -> bool {
        let cancelled = self.inner.lock_state().in_flight.remove(key);
        match cancelled {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                info!("event=asset_cancel module=cache status=ok key={key}");
                true
            }
            None => false,
        }
    }

    /// Runs an eviction pass immediately. Returns the number of entries
    /// evicted.
    pub fn evict_now(&self) -> usize {
        self.inner.run_eviction()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock_state().resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock_state();
        CacheStats {
            entries: state.entries.len(),
            resident_bytes: state.resident_bytes,
            in_flight: state.in_flight.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

impl CacheInner {
    fn spawn_fetch(
        self: Arc<Self>,
        key: String,
        fetcher: Arc<dyn AssetFetcher>,
        options: FetchOptions,
        cancel: CancellationToken,
        id: u64,
    ) -> SharedFetch {
        let task = tokio::spawn(Arc::clone(&self).fetch_and_store(
            key.clone(),
            fetcher,
            options,
            cancel,
            id,
        ));
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    self.lock_state().finish_fetch(&key, id);
                    Err(AssetFetchError::Terminal {
                        key,
                        reason: format!("fetch task aborted: {join_err}"),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn fetch_and_store(
        self: Arc<Self>,
        key: String,
        fetcher: Arc<dyn AssetFetcher>,
        options: FetchOptions,
        cancel: CancellationToken,
        id: u64,
    ) -> AssetResult<AssetHandle> {
        let backoff = Backoff {
            base: self.config.base_delay(),
            max: self.config.max_delay(),
        };
        let started_at = Instant::now();
        let result = fetch_with_retry(fetcher.as_ref(), &key, &options, backoff, &cancel).await;

        let bytes = match result {
            Ok(bytes) if !cancel.is_cancelled() => bytes,
            Ok(_) => {
                self.lock_state().finish_fetch(&key, id);
                return Err(AssetFetchError::Cancelled { key });
            }
            Err(err) => {
                self.lock_state().finish_fetch(&key, id);
                warn!(
                    "event=asset_fetch module=cache status=error key={key} duration_ms={} retryable={} error={err}",
                    started_at.elapsed().as_millis(),
                    err.is_retryable()
                );
                return Err(err);
            }
        };

        let handle = AssetHandle::new(&key, bytes);
        let size_bytes = handle.len() as u64;
        let (replaced, evicted) = {
            let mut state = self.lock_state();
            state.finish_fetch(&key, id);
            let now = Instant::now();
            let seq = state.next_access_seq();
            let replaced = state.remove_entry(&key);
            state.resident_bytes += size_bytes;
            state.entries.insert(
                key.clone(),
                AssetCacheEntry {
                    handle: handle.clone(),
                    size_bytes,
                    created_at: now,
                    last_accessed_at: now,
                    access_seq: seq,
                    expires_at: options.ttl.map(|ttl| now + ttl),
                    fetcher,
                },
            );
            let evicted = self.schedule_eviction(&mut state);
            (replaced, evicted)
        };

        if let Some(entry) = replaced {
            entry.release();
        }
        self.finish_eviction(evicted);
        info!(
            "event=asset_fetch module=cache status=ok key={key} size_bytes={size_bytes} duration_ms={}",
            started_at.elapsed().as_millis()
        );
        Ok(handle)
    }

    /// Schedules or runs a pass once resident size exceeds the threshold.
    ///
    /// Returns entries evicted inline; the caller releases them after the
    /// state lock is dropped.
    fn schedule_eviction(self: &Arc<Self>, state: &mut CacheState) -> Vec<AssetCacheEntry> {
        if state.resident_bytes <= self.config.max_resident_bytes || state.eviction_scheduled {
            return Vec::new();
        }
        let debounce = self.config.eviction_debounce();
        if debounce.is_zero() {
            return evict_oldest(state, &self.config);
        }

        state.eviction_scheduled = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.run_eviction();
        });
        Vec::new()
    }

    fn run_eviction(&self) -> usize {
        let evicted = {
            let mut state = self.lock_state();
            state.eviction_scheduled = false;
            evict_oldest(&mut state, &self.config)
        };
        let count = evicted.len();
        self.finish_eviction(evicted);
        count
    }

    fn finish_eviction(&self, evicted: Vec<AssetCacheEntry>) {
        if evicted.is_empty() {
            return;
        }
        let freed: u64 = evicted.iter().map(|entry| entry.size_bytes).sum();
        for entry in &evicted {
            debug!(
                "event=asset_evict module=cache status=entry key={} age_ms={}",
                entry.handle.key(),
                entry.created_at.elapsed().as_millis()
            );
            entry.release();
            self.events.emit(
                EventKind::Evicted,
                entry.handle.key(),
                Some(format!("size_bytes={}", entry.size_bytes)),
            );
        }
        info!(
            "event=asset_evict module=cache status=ok evicted={} freed_bytes={freed}",
            evicted.len()
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheState {
    fn next_access_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn remove_entry(&mut self, key: &str) -> Option<AssetCacheEntry> {
        let entry = self.entries.remove(key)?;
        self.resident_bytes = self.resident_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Clears the in-flight slot unless a newer fetch already replaced it.
    fn finish_fetch(&mut self, key: &str, id: u64) {
        if self.in_flight.get(key).is_some_and(|fetch| fetch.id == id) {
            self.in_flight.remove(key);
        }
    }
}

/// Removes least recently used entries while over the threshold.
///
/// One pass removes at least `ceil(len * fraction)` entries (minimum one)
/// and keeps going until resident size is back under the threshold.
fn evict_oldest(state: &mut CacheState, config: &AssetCacheConfig) -> Vec<AssetCacheEntry> {
    if state.resident_bytes <= config.max_resident_bytes {
        return Vec::new();
    }

    let mut candidates: Vec<(Instant, u64, String)> = state
        .entries
        .iter()
        .map(|(key, entry)| (entry.last_accessed_at, entry.access_seq, key.clone()))
        .collect();
    candidates.sort();

    let minimum = ((candidates.len() as f64) * config.eviction_fraction).ceil() as usize;
    let minimum = minimum.max(1);
    let mut evicted = Vec::new();
    for (_, _, key) in candidates {
        if evicted.len() >= minimum && state.resident_bytes <= config.max_resident_bytes {
            break;
        }
        if let Some(entry) = state.remove_entry(&key) {
            evicted.push(entry);
        }
    }
    state.evictions += evicted.len() as u64;
    evicted
}
