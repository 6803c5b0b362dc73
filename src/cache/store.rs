//! In-memory data cache with stale-while-revalidate reads.
//!
//! Reads of a live entry return immediately. Once an entry has aged past
//! `refresh_threshold` of its TTL, the first read spawns a single background
//! refresh while the stale value keeps being served. Missing or expired keys
//! are fetched inline. Fetch failures never reach the caller: the previous
//! value (if any) is served instead.
//!
//! The store is bounded by `max_entries`; when a new key would overflow it,
//! the resident entry with the fewest hits since its last write is evicted.
//! This is a linear scan, which is fine for the tens of entries the store is
//! sized for.

use crate::cache::entry::{CacheEntry, EntryInfo};
use crate::cache::events::{CacheEvent, EvictionReason, ListenerId, Listeners};
use crate::cache::scheduler::{Scheduler, Task, TimerHandle, TokioScheduler};
use crate::error::HearthError;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Async callback that produces a fresh value for a key
pub type RefreshFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, HearthError>> + Send + Sync>;

/// Wrap a closure returning a future into a [`RefreshFn`]
pub fn refresh_fn<T, F, Fut>(refresh: F) -> RefreshFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, HearthError>> + Send + 'static,
{
    Arc::new(move || refresh().boxed())
}

/// Configuration for a [`DataCache`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when a caller does not supply one
    pub default_ttl: Duration,
    /// Maximum number of resident entries
    pub max_entries: usize,
    /// Fraction of the TTL after which reads trigger a background refresh
    pub refresh_threshold: f64,
    /// Whether aging entries are refreshed in the background at all
    pub enable_background_refresh: bool,
    /// How often expired entries are swept
    pub cleanup_interval: Duration,
    /// Upper bound on a single refresh callback run; `None` waits forever.
    /// Callbacks registered through [`DataCache::get_with_timeout`] carry
    /// their own bound instead.
    pub fetch_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_entries: 50,
            refresh_threshold: 0.8,
            enable_background_refresh: true,
            cleanup_interval: Duration::from_secs(60),
            fetch_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), HearthError> {
        if self.max_entries == 0 {
            return Err(HearthError::Config(
                "max_entries must be at least 1".to_string(),
            ));
        }
        if !(self.refresh_threshold > 0.0 && self.refresh_threshold <= 1.0) {
            return Err(HearthError::Config(format!(
                "refresh_threshold must be in (0, 1], got {}",
                self.refresh_threshold
            )));
        }
        if self.default_ttl.is_zero() {
            return Err(HearthError::Config(
                "default_ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cumulative counters plus current occupancy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_entries: usize,
    pub pending_refreshes: usize,
    pub scheduled_refreshes: usize,
    pub hit_rate: f64,
}

/// Anything that can drop a family of keys by pattern.
///
/// Lets one owner clear related keys that live in stores of different
/// value types.
pub trait PatternInvalidator: Send + Sync {
    fn invalidate_matching(&self, pattern: &Regex, reason: EvictionReason) -> usize;
}

#[derive(Clone)]
struct RegisteredRefresh<T> {
    fetch: RefreshFn<T>,
    ttl: Duration,
    fetch_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    refreshes: u64,
    evictions: u64,
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Keys with a background refresh in flight, tagged with the owning task's token
    refreshing: HashMap<String, u64>,
    next_refresh_token: u64,
    /// Most recent refresh callback per key
    refreshers: HashMap<String, RegisteredRefresh<T>>,
    /// Periodic refresh timers per key
    timers: HashMap<String, TimerHandle>,
    counters: Counters,
}

impl<T: Clone> CacheState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            refreshing: HashMap::new(),
            next_refresh_token: 0,
            refreshers: HashMap::new(),
            timers: HashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Drop a key along with its refresh marker and periodic timer
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        self.refreshing.remove(key);
        if let Some(timer) = self.timers.remove(key) {
            timer.cancel();
        }
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.counters.evictions += 1;
        }
        removed
    }

    /// Remove `key` only if the entry under it has expired at `now`
    fn remove_if_expired(&mut self, key: &str, now: Instant) -> bool {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired_at(now));
        expired && self.remove(key).is_some()
    }

    /// Mark `key` as refreshing. `None` if a refresh already owns it.
    fn claim_refresh(&mut self, key: &str) -> Option<u64> {
        if self.refreshing.contains_key(key) {
            return None;
        }
        self.next_refresh_token += 1;
        self.refreshing.insert(key.to_string(), self.next_refresh_token);
        Some(self.next_refresh_token)
    }

    /// Clear the refresh marker for `key` if `token` still owns it
    fn release_refresh(&mut self, key: &str, token: u64) {
        if self.refreshing.get(key) == Some(&token) {
            self.refreshing.remove(key);
        }
    }

    /// Store a new version of `key`, evicting first if a new key would not fit.
    ///
    /// Returns the stored version and the evicted key, if any.
    fn insert(
        &mut self,
        key: &str,
        data: T,
        ttl: Duration,
        now: Instant,
        max_entries: usize,
    ) -> (u64, Option<String>) {
        let mut evicted = None;

        let version = match self.entries.get(key) {
            Some(existing) => existing.version + 1,
            None => {
                if self.entries.len() >= max_entries {
                    evicted = self.least_hit_key();
                    if let Some(victim) = &evicted {
                        self.remove(victim);
                    }
                }
                1
            }
        };

        self.entries
            .insert(key.to_string(), CacheEntry::new(data, ttl, now, version));
        (version, evicted)
    }

    /// First-found entry with the fewest hits
    fn least_hit_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.hits)
            .map(|(key, _)| key.clone())
    }
}

/// Outcome of the locked part of a read
enum Lookup<T> {
    Hit { data: T, refresh_token: Option<u64> },
    Miss { previous: Option<T> },
}

struct CacheInner<T> {
    config: CacheConfig,
    state: Mutex<CacheState<T>>,
    listeners: Listeners<CacheEvent>,
    scheduler: Arc<dyn Scheduler>,
    cleanup: Mutex<Option<TimerHandle>>,
}

impl<T> CacheInner<T> {
    fn state(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<CacheEvent>) {
        for event in &events {
            self.listeners.emit(event);
        }
    }

    fn cancel_timers(&self) {
        if let Some(cleanup) = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cleanup.cancel();
        }
        for (_, timer) in self.state().timers.drain() {
            timer.cancel();
        }
    }
}

impl<T> Drop for CacheInner<T> {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Shared, cloneable handle to one cache instance
pub struct DataCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for DataCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> DataCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache and start its cleanup sweep on `scheduler`
    pub fn new(config: CacheConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let cleanup_interval = config.cleanup_interval;
        let inner = Arc::new(CacheInner {
            config,
            state: Mutex::new(CacheState::new()),
            listeners: Listeners::new(),
            scheduler,
            cleanup: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let sweep: Task = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(cache) = upgrade(&weak) {
                    cache.sweep_expired();
                }
            }
            .boxed()
        });
        let handle = inner.scheduler.schedule_repeating(cleanup_interval, sweep);
        *inner.cleanup.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { inner }
    }

    /// Cache with default configuration on the tokio scheduler
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default(), Arc::new(TokioScheduler))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the live value for `key`, counting a hit or a miss. Never fetches.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let found = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let found = match state.entries.get_mut(key) {
                Some(entry) if !entry.is_expired_at(now) => {
                    entry.hits += 1;
                    Some(entry.data.clone())
                }
                _ => None,
            };
            if found.is_some() {
                state.counters.hits += 1;
            } else {
                state.counters.misses += 1;
            }
            found
        };

        let key = key.to_string();
        if found.is_some() {
            self.inner.listeners.emit(&CacheEvent::Hit { key });
        } else {
            self.inner.listeners.emit(&CacheEvent::Miss { key });
        }
        found
    }

    /// Return the live value for `key` without touching counters or emitting events
    pub fn peek(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        self.inner
            .state()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.data.clone())
    }

    /// Read-through get with a closure as the refresh callback
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F, ttl: Option<Duration>) -> Option<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HearthError>> + Send + 'static,
    {
        self.get_with(key, refresh_fn(refresh), ttl).await
    }

    /// Read-through get.
    ///
    /// Live entries are returned without awaiting anything; an aging entry also
    /// spawns one background refresh per key. Missing or expired entries are
    /// fetched inline, falling back to the expired value (or `None`) if the
    /// fetch fails.
    pub async fn get_with(&self, key: &str, fetch: RefreshFn<T>, ttl: Option<Duration>) -> Option<T> {
        self.get_with_timeout(key, fetch, ttl, self.inner.config.fetch_timeout)
            .await
    }

    /// Read-through get where the callback runs under `fetch_timeout` instead
    /// of the configured bound.
    ///
    /// Pass `None` for callbacks that bound their own work, such as a retry
    /// loop that times out each attempt. The bound is remembered with the
    /// callback and also applies to background and forced refreshes.
    pub async fn get_with_timeout(
        &self,
        key: &str,
        fetch: RefreshFn<T>,
        ttl: Option<Duration>,
        fetch_timeout: Option<Duration>,
    ) -> Option<T> {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let threshold = self.inner.config.refresh_threshold;
        let background = self.inner.config.enable_background_refresh;
        let now = Instant::now();

        let lookup = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.refreshers.insert(
                key.to_string(),
                RegisteredRefresh {
                    fetch: fetch.clone(),
                    ttl,
                    fetch_timeout,
                },
            );

            match state.entries.get_mut(key) {
                Some(entry) if !entry.is_expired_at(now) => {
                    entry.hits += 1;
                    state.counters.hits += 1;
                    let aging = background && entry.needs_refresh_at(now, threshold);
                    let data = entry.data.clone();
                    Lookup::Hit {
                        data,
                        refresh_token: if aging {
                            state.claim_refresh(key)
                        } else {
                            None
                        },
                    }
                }
                expired => {
                    state.counters.misses += 1;
                    Lookup::Miss {
                        previous: expired.map(|entry| entry.data.clone()),
                    }
                }
            }
        };

        match lookup {
            Lookup::Hit {
                data,
                refresh_token,
            } => {
                debug!(cache_key = %key, "Cache HIT");
                self.inner.listeners.emit(&CacheEvent::Hit {
                    key: key.to_string(),
                });
                if let Some(token) = refresh_token {
                    self.spawn_background_refresh(
                        key.to_string(),
                        token,
                        fetch,
                        ttl,
                        fetch_timeout,
                    );
                }
                Some(data)
            }
            Lookup::Miss { previous } => {
                debug!(
                    cache_key = %key,
                    stale = previous.is_some(),
                    "Cache MISS, fetching"
                );
                self.inner.listeners.emit(&CacheEvent::Miss {
                    key: key.to_string(),
                });

                match run_fetch(&fetch, fetch_timeout).await {
                    Ok(data) => {
                        self.store_refreshed(key, data.clone(), ttl, false);
                        Some(data)
                    }
                    Err(e) => {
                        warn!(
                            cache_key = %key,
                            error = %e,
                            serving_stale = previous.is_some(),
                            "Fetch failed on cache miss"
                        );
                        previous
                    }
                }
            }
        }
    }

    /// Unconditionally store `data` under `key`, returning the new version
    pub fn set(&self, key: &str, data: T, ttl: Option<Duration>) -> u64 {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let (version, evicted) = self.inner.state().insert(
            key,
            data,
            ttl,
            Instant::now(),
            self.inner.config.max_entries,
        );

        let mut events = Vec::with_capacity(2);
        if let Some(victim) = evicted {
            debug!(cache_key = %victim, "Evicted least-hit entry");
            events.push(CacheEvent::Eviction {
                key: victim,
                reason: EvictionReason::MemoryPressure,
            });
        }
        events.push(CacheEvent::Write {
            key: key.to_string(),
            version,
            ttl,
        });
        self.inner.emit_all(events);

        version
    }

    /// Remove `key`, its refresh marker and its periodic timer
    pub fn invalidate(&self, key: &str, reason: EvictionReason) -> bool {
        let removed = self.inner.state().remove(key).is_some();
        if removed {
            debug!(cache_key = %key, reason = %reason, "Invalidated entry");
            self.inner.listeners.emit(&CacheEvent::Eviction {
                key: key.to_string(),
                reason,
            });
        }
        removed
    }

    /// Invalidate every key matching `pattern`, returning how many were removed
    pub fn invalidate_pattern(&self, pattern: &Regex, reason: EvictionReason) -> usize {
        let matching: Vec<String> = self
            .inner
            .state()
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();

        let removed = matching
            .iter()
            .filter(|key| self.invalidate(key, reason.clone()))
            .count();

        debug!(pattern = %pattern, removed, "Invalidated entries by pattern");
        removed
    }

    /// Drop every entry, timer and stored callback. Counters are kept.
    pub fn clear(&self, reason: EvictionReason) -> usize {
        let removed_keys: Vec<String> = {
            let mut state = self.inner.state();
            for (_, timer) in state.timers.drain() {
                timer.cancel();
            }
            state.refreshers.clear();
            state.refreshing.clear();
            let keys: Vec<String> = state.entries.drain().map(|(key, _)| key).collect();
            state.counters.evictions += keys.len() as u64;
            keys
        };

        info!(removed = removed_keys.len(), reason = %reason, "Cache cleared");

        let count = removed_keys.len();
        self.inner.emit_all(
            removed_keys
                .into_iter()
                .map(|key| CacheEvent::Eviction {
                    key,
                    reason: reason.clone(),
                })
                .collect(),
        );
        count
    }

    /// True iff a live entry exists. Expired entries found here are removed.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let removed = {
            let mut state = self.inner.state();
            if !state.entries.contains_key(key) {
                return false;
            }
            state.remove_if_expired(key, now)
        };

        if removed {
            debug!(cache_key = %key, "Dropped expired entry on lookup");
            self.inner.listeners.emit(&CacheEvent::Eviction {
                key: key.to_string(),
                reason: EvictionReason::TtlExpired,
            });
            return false;
        }
        true
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        self.inner
            .state()
            .entries
            .get(key)
            .map(|entry| entry.info_at(now, self.inner.config.refresh_threshold))
    }

    /// Re-fetch `key` every `interval`, independently of reads.
    ///
    /// Replaces any timer already installed for the key.
    pub fn schedule_refresh<F, Fut>(
        &self,
        key: &str,
        refresh: F,
        interval: Duration,
        ttl: Option<Duration>,
    ) -> TimerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HearthError>> + Send + 'static,
    {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let fetch_timeout = self.inner.config.fetch_timeout;
        let fetch = refresh_fn(refresh);

        let weak = Arc::downgrade(&self.inner);
        let task_key = key.to_string();
        let task_fetch = fetch.clone();
        let task: Task = Arc::new(move || {
            let weak = weak.clone();
            let key = task_key.clone();
            let fetch = task_fetch.clone();
            async move {
                let Some(cache) = upgrade(&weak) else {
                    return;
                };
                match run_fetch(&fetch, fetch_timeout).await {
                    Ok(data) => cache.store_refreshed(&key, data, ttl, true),
                    Err(e) => {
                        warn!(cache_key = %key, error = %e, "Scheduled refresh failed");
                    }
                }
            }
            .boxed()
        });

        let handle = self.inner.scheduler.schedule_repeating(interval, task);
        {
            let mut state = self.inner.state();
            state.refreshers.insert(
                key.to_string(),
                RegisteredRefresh {
                    fetch,
                    ttl,
                    fetch_timeout,
                },
            );
            if let Some(previous) = state.timers.insert(key.to_string(), handle.clone()) {
                previous.cancel();
            }
        }

        info!(
            cache_key = %key,
            interval_ms = interval.as_millis() as u64,
            "Scheduled periodic refresh"
        );
        handle
    }

    /// Re-fetch `key` now with its most recently registered callback
    pub async fn force_refresh(&self, key: &str) -> Option<T> {
        let registered = self.inner.state().refreshers.get(key).cloned();
        let Some(RegisteredRefresh {
            fetch,
            ttl,
            fetch_timeout,
        }) = registered
        else {
            warn!(cache_key = %key, "No refresh callback registered, cannot force refresh");
            return None;
        };

        match run_fetch(&fetch, fetch_timeout).await {
            Ok(data) => {
                self.store_refreshed(key, data.clone(), ttl, false);
                Some(data)
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Forced refresh failed");
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state();
        let lookups = state.counters.hits + state.counters.misses;
        CacheStats {
            hits: state.counters.hits,
            misses: state.counters.misses,
            refreshes: state.counters.refreshes,
            evictions: state.counters.evictions,
            size: state.entries.len(),
            max_entries: self.inner.config.max_entries,
            pending_refreshes: state.refreshing.len(),
            scheduled_refreshes: state.timers.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.counters.hits as f64 / lookups as f64
            },
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.state().entries.keys().cloned().collect()
    }

    /// Number of resident entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) -> Result<(), HearthError> + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Stop all timers, drop every entry and detach listeners
    pub fn dispose(&self) {
        self.inner.cancel_timers();
        self.clear(EvictionReason::Disposed);
        self.inner.listeners.clear();
        info!("Cache disposed");
    }

    /// Remove every entry whose TTL has passed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed: Vec<String> = {
            let mut state = self.inner.state();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter(|key| state.remove_if_expired(key, now))
                .collect()
        };

        let count = removed.len();
        if count > 0 {
            debug!(removed = count, "Swept expired cache entries");
        }
        self.inner.emit_all(
            removed
                .into_iter()
                .map(|key| CacheEvent::Eviction {
                    key,
                    reason: EvictionReason::TtlExpired,
                })
                .collect(),
        );
        count
    }

    fn spawn_background_refresh(
        &self,
        key: String,
        token: u64,
        fetch: RefreshFn<T>,
        ttl: Duration,
        fetch_timeout: Option<Duration>,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            debug!(cache_key = %key, "Background refresh started");
            match run_fetch(&fetch, fetch_timeout).await {
                Ok(data) => cache.store_refreshed(&key, data, ttl, true),
                Err(e) => {
                    warn!(cache_key = %key, error = %e, "Background refresh failed, serving stale data");
                }
            }
            cache.inner.state().release_refresh(&key, token);
        });
    }

    fn store_refreshed(&self, key: &str, data: T, ttl: Duration, background: bool) {
        let (version, evicted) = {
            let mut state = self.inner.state();
            state.counters.refreshes += 1;
            state.insert(key, data, ttl, Instant::now(), self.inner.config.max_entries)
        };

        debug!(cache_key = %key, version, background, "Stored refreshed entry");

        let mut events = Vec::with_capacity(2);
        if let Some(victim) = evicted {
            events.push(CacheEvent::Eviction {
                key: victim,
                reason: EvictionReason::MemoryPressure,
            });
        }
        events.push(CacheEvent::Refresh {
            key: key.to_string(),
            version,
            background,
        });
        self.inner.emit_all(events);
    }
}

impl<T> PatternInvalidator for DataCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn invalidate_matching(&self, pattern: &Regex, reason: EvictionReason) -> usize {
        self.invalidate_pattern(pattern, reason)
    }
}

async fn run_fetch<T>(fetch: &RefreshFn<T>, limit: Option<Duration>) -> Result<T, HearthError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fetch())
            .await
            .map_err(|_| HearthError::Timeout(limit))?,
        None => fetch().await,
    }
}

fn upgrade<T>(weak: &Weak<CacheInner<T>>) -> Option<DataCache<T>> {
    weak.upgrade().map(|inner| DataCache { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn test_cache(config: CacheConfig) -> DataCache<String> {
        DataCache::new(config, Arc::new(TokioScheduler))
    }

    fn recorded_events(cache: &DataCache<String>) -> Arc<Mutex<Vec<CacheEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        cache.add_listener(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        events
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache = test_cache(CacheConfig::default());
        cache.set("k", "v".to_string(), Some(ms(100)));

        advance(ms(99)).await;
        assert!(cache.has("k"));

        advance(ms(1)).await;
        assert!(!cache.has("k"));
        // has() lazily removes the expired entry
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_get_counts_hits_and_misses() {
        let cache = test_cache(CacheConfig::default());
        let events = recorded_events(&cache);

        assert_eq!(cache.get("k"), None);
        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.get("k"), Some("v".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.entry_info("k").unwrap().hits, 1);

        let kinds: Vec<&str> = events.lock().unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["miss", "write", "hit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate_timeline() {
        let cache = test_cache(CacheConfig {
            refresh_threshold: 0.8,
            ..CacheConfig::default()
        });

        let first = cache
            .get_or_refresh("k", || async { Ok("v1".to_string()) }, Some(ms(100)))
            .await;
        assert_eq!(first, Some("v1".to_string()));
        assert_eq!(cache.entry_info("k").unwrap().version, 1);

        advance(ms(85)).await;
        let aging = cache
            .get_or_refresh(
                "k",
                || async {
                    sleep(ms(10)).await;
                    Ok("v2".to_string())
                },
                Some(ms(100)),
            )
            .await;
        assert_eq!(aging, Some("v1".to_string()));

        sleep(ms(10)).await;
        settle().await;

        let info = cache.entry_info("k").unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(cache.peek("k"), Some("v2".to_string()));
        assert_eq!(cache.stats().pending_refreshes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_fetched_inline() {
        let cache = test_cache(CacheConfig {
            enable_background_refresh: false,
            ..CacheConfig::default()
        });
        cache
            .get_or_refresh("k", || async { Ok("v1".to_string()) }, Some(ms(100)))
            .await;

        advance(ms(101)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = cache
            .get_or_refresh(
                "k",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok("v3".to_string()) }
                },
                Some(ms(100)),
            )
            .await;

        assert_eq!(value, Some("v3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.entry_info("k").unwrap().version, 2);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_background_refresh_per_key() {
        let cache = test_cache(CacheConfig::default());
        cache
            .get_or_refresh("k", || async { Ok("v1".to_string()) }, Some(ms(100)))
            .await;
        advance(ms(90)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = calls.clone();
            let value = cache
                .get_or_refresh(
                    "k",
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async {
                            sleep(ms(50)).await;
                            Ok("v2".to_string())
                        }
                    },
                    Some(ms(100)),
                )
                .await;
            assert_eq!(value, Some("v1".to_string()));
            settle().await;
        }

        assert_eq!(cache.stats().pending_refreshes, 1);
        sleep(ms(60)).await;
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek("k"), Some("v2".to_string()));
        assert_eq!(cache.stats().pending_refreshes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_background_refresh_serves_stale() {
        let cache = test_cache(CacheConfig::default());
        let events = recorded_events(&cache);
        cache
            .get_or_refresh("k", || async { Ok("v1".to_string()) }, Some(ms(100)))
            .await;
        advance(ms(90)).await;

        let value = cache
            .get_or_refresh(
                "k",
                || async { Err(HearthError::Upstream("db offline".to_string())) },
                Some(ms(100)),
            )
            .await;
        assert_eq!(value, Some("v1".to_string()));
        settle().await;

        let again = cache.get("k");
        assert_eq!(again, Some("v1".to_string()));
        assert_eq!(cache.entry_info("k").unwrap().version, 1);
        assert_eq!(cache.stats().pending_refreshes, 0);

        let refreshes = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, CacheEvent::Refresh { .. }))
            .count();
        assert_eq!(refreshes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_failure_serves_expired_value_or_none() {
        let cache = test_cache(CacheConfig::default());

        let cold = cache
            .get_or_refresh(
                "cold",
                || async { Err(HearthError::Upstream("down".to_string())) },
                None,
            )
            .await;
        assert_eq!(cold, None);

        cache.set("warm", "old".to_string(), Some(ms(100)));
        advance(ms(150)).await;
        let warm = cache
            .get_or_refresh(
                "warm",
                || async { Err(HearthError::Upstream("down".to_string())) },
                None,
            )
            .await;
        assert_eq!(warm, Some("old".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_clears_refresh_marker() {
        let cache = test_cache(CacheConfig {
            fetch_timeout: Some(ms(500)),
            ..CacheConfig::default()
        });
        cache
            .get_or_refresh("k", || async { Ok("v1".to_string()) }, Some(Duration::from_secs(10)))
            .await;
        advance(Duration::from_secs(9)).await;

        cache
            .get_or_refresh(
                "k",
                || futures::future::pending::<Result<String, HearthError>>(),
                Some(Duration::from_secs(10)),
            )
            .await;
        settle().await;
        assert_eq!(cache.stats().pending_refreshes, 1);

        sleep(ms(600)).await;
        settle().await;
        assert_eq!(cache.stats().pending_refreshes, 0);
        assert_eq!(cache.peek("k"), Some("v1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_removes_least_hit_entry() {
        let cache = test_cache(CacheConfig {
            max_entries: 3,
            ..CacheConfig::default()
        });
        let events = recorded_events(&cache);

        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.set("c", "3".to_string(), None);
        cache.get("a");
        cache.get("a");
        cache.get("c");

        cache.set("d", "4".to_string(), None);

        assert_eq!(cache.len(), 3);
        assert!(!cache.has("b"));
        assert!(cache.has("a") && cache.has("c") && cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
        assert!(events.lock().unwrap().contains(&CacheEvent::Eviction {
            key: "b".to_string(),
            reason: EvictionReason::MemoryPressure,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_bumps_version_and_resets_hits() {
        let cache = test_cache(CacheConfig {
            max_entries: 1,
            ..CacheConfig::default()
        });

        assert_eq!(cache.set("k", "a".to_string(), None), 1);
        cache.get("k");
        assert_eq!(cache.set("k", "b".to_string(), None), 2);

        let info = cache.entry_info("k").unwrap();
        assert_eq!(info.hits, 0);
        assert_eq!(info.version, 2);
        // Overwriting an existing key never evicts
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_pattern_touches_only_matching_keys() {
        let cache = test_cache(CacheConfig::default());
        for key in ["ai_summary", "ai_trends", "family_data", "member_stats"] {
            cache.set(key, key.to_string(), None);
        }

        let pattern = Regex::new("^ai_").unwrap();
        let removed = cache.invalidate_pattern(&pattern, EvictionReason::Manual);

        assert_eq!(removed, 2);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["family_data", "member_stats"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_reports_removal() {
        let cache = test_cache(CacheConfig::default());
        let events = recorded_events(&cache);
        cache.set("k", "v".to_string(), None);

        assert!(cache.invalidate("k", EvictionReason::Other("user_logout".into())));
        assert!(!cache.invalidate("k", EvictionReason::Manual));
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&CacheEvent::Eviction {
                key: "k".to_string(),
                reason: EvictionReason::Other("user_logout".into()),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_keeps_counters_and_adds_evictions() {
        let cache = test_cache(CacheConfig::default());
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.get("a");

        assert_eq!(cache.clear(EvictionReason::Cleared), 2);
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.evictions, 2);
        assert_eq!(cache.force_refresh("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sweep_removes_unread_expired_entries() {
        let cache = test_cache(CacheConfig::default());
        cache.set("short", "v".to_string(), Some(Duration::from_secs(10)));
        cache.set("long", "v".to_string(), Some(Duration::from_secs(600)));

        sleep(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(cache.keys(), vec!["long".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_uses_last_callback() {
        let cache = test_cache(CacheConfig::default());
        assert_eq!(cache.force_refresh("k").await, None);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        cache
            .get_or_refresh(
                "k",
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok(format!("v{}", n)) }
                },
                None,
            )
            .await;

        assert_eq!(cache.force_refresh("k").await, Some("v2".to_string()));
        assert_eq!(cache.entry_info("k").unwrap().version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_refresh_replaces_previous_timer() {
        let cache = test_cache(CacheConfig::default());
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let counter = first_calls.clone();
        let first = cache.schedule_refresh(
            "k",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok("first".to_string()) }
            },
            Duration::from_secs(10),
            None,
        );
        sleep(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(cache.peek("k"), Some("first".to_string()));

        let counter = second_calls.clone();
        cache.schedule_refresh(
            "k",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok("second".to_string()) }
            },
            Duration::from_secs(10),
            None,
        );
        assert!(first.is_cancelled());

        sleep(Duration::from_secs(25)).await;
        settle().await;

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.peek("k"), Some("second".to_string()));
        assert_eq!(cache.stats().scheduled_refreshes, 1);

        cache.invalidate("k", EvictionReason::Manual);
        assert_eq!(cache.stats().scheduled_refreshes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_can_reenter_cache() {
        let cache = test_cache(CacheConfig::default());
        let reentrant = cache.clone();
        cache.add_listener(move |event| {
            if let CacheEvent::Write { key, .. } = event {
                let _ = reentrant.entry_info(key);
            }
            Ok(())
        });
        cache.add_listener(|_| Err(HearthError::Listener("broken observer".into())));

        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_empties_cache() {
        let cache = test_cache(CacheConfig::default());
        cache.schedule_refresh(
            "k",
            || async { Ok("v".to_string()) },
            Duration::from_secs(1),
            None,
        );
        cache.set("k", "v".to_string(), None);

        cache.dispose();
        sleep(Duration::from_secs(5)).await;

        assert!(cache.is_empty());
        assert_eq!(cache.stats().scheduled_refreshes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_removal_spares_rewritten_entry() {
        let mut state: CacheState<String> = CacheState::new();
        let start = Instant::now();
        state.insert("k", "old".to_string(), ms(100), start, 10);

        // The sweep saw "k" expired, then a write landed before removal
        let later = start + ms(150);
        state.insert("k", "new".to_string(), ms(100), later, 10);

        assert!(!state.remove_if_expired("k", later));
        assert_eq!(state.entries["k"].data, "new");
        assert_eq!(state.counters.evictions, 0);

        assert!(state.remove_if_expired("k", later + ms(100)));
        assert!(state.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reports_each_expired_key() {
        let cache = test_cache(CacheConfig::default());
        let events = recorded_events(&cache);
        cache.set("short", "v".to_string(), Some(ms(100)));
        cache.set("long", "v".to_string(), Some(Duration::from_secs(10)));

        advance(ms(150)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.sweep_expired(), 0);

        assert_eq!(cache.keys(), vec!["long".to_string()]);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&CacheEvent::Eviction {
                key: "short".to_string(),
                reason: EvictionReason::TtlExpired,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_refresh_keeps_newer_refresh_marker() {
        let cache = test_cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let slow_fetch = |latency: Duration, value: &'static str| {
            let counter = calls.clone();
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    sleep(latency).await;
                    Ok::<_, HearthError>(value.to_string())
                }
            }
        };

        cache.set("k", "v1".to_string(), Some(ms(100)));
        advance(ms(90)).await;
        cache
            .get_or_refresh("k", slow_fetch(ms(50), "first"), Some(ms(100)))
            .await;
        settle().await;

        // Invalidation drops the first marker; a second refresh claims the key
        cache.invalidate("k", EvictionReason::Manual);
        cache.set("k", "v2".to_string(), Some(ms(10)));
        advance(ms(9)).await;
        cache
            .get_or_refresh("k", slow_fetch(ms(200), "second"), Some(ms(10)))
            .await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // First refresh finishes at t=140 while the second is still running
        sleep(ms(45)).await;
        settle().await;
        assert_eq!(cache.peek("k"), Some("first".to_string()));
        assert_eq!(cache.stats().pending_refreshes, 1);

        sleep(ms(200)).await;
        settle().await;
        assert_eq!(cache.stats().pending_refreshes, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_fetch_timeout_overrides_config() {
        let cache = test_cache(CacheConfig {
            fetch_timeout: Some(ms(500)),
            ..CacheConfig::default()
        });

        let slow = refresh_fn(|| async {
            sleep(Duration::from_secs(2)).await;
            Ok("slow".to_string())
        });
        assert_eq!(cache.get_with("bounded", slow.clone(), None).await, None);
        assert_eq!(
            cache.get_with_timeout("unbounded", slow, None, None).await,
            Some("slow".to_string())
        );

        // Forced refreshes reuse the bound registered with the callback
        assert_eq!(
            cache.force_refresh("unbounded").await,
            Some("slow".to_string())
        );
        assert_eq!(cache.force_refresh("bounded").await, None);
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig {
            max_entries: 0,
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
        assert!(CacheConfig {
            refresh_threshold: 1.5,
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
    }
}
