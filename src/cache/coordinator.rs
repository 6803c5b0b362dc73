//! Refresh policy for the family dataset.
//!
//! The coordinator owns the `family_data` key of a [`DataCache`] and decides
//! when and whether to re-fetch it: periodically, on demand, or once after a
//! delay. With smart refresh enabled a cheap signature comparison skips
//! cycles where nothing changed. Failed fetches are retried with a fixed
//! delay, and every cycle feeds the [`RefreshStatus`] counters.

use crate::cache::events::{EvictionReason, ListenerId, Listeners};
use crate::cache::scheduler::{Scheduler, Task, TimerHandle};
use crate::cache::signature::DataChangeSignature;
use crate::cache::status::{after, RefreshStatus, StatusTracker};
use crate::cache::store::{DataCache, PatternInvalidator, RefreshFn};
use crate::error::HearthError;
use crate::services::family::{FamilyData, FamilyDataSource};
use chrono::Utc;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Cache key of the aggregated family dataset
pub const FAMILY_DATA_KEY: &str = "family_data";

/// Keys derived from the family dataset, cleared together on a forced refresh
pub static RELATED_KEYS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(family_data|ai_summary|member_stats|trends_data)")
        .expect("related keys pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshConfig {
    /// Period of the automatic refresh timer
    pub interval: Duration,
    pub enable_auto_refresh: bool,
    /// TTL of the cached dataset; older data counts as stale
    pub stale_threshold: Duration,
    /// Extra attempts after the first failed fetch
    pub max_retries: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    /// Skip cycles when the data signature is unchanged
    pub enable_smart_refresh: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            enable_auto_refresh: true,
            stale_threshold: Duration::from_secs(10 * 60),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            enable_smart_refresh: true,
        }
    }
}

impl RefreshConfig {
    pub fn validate(&self) -> Result<(), HearthError> {
        if self.interval.is_zero() {
            return Err(HearthError::Config(
                "refresh interval must be greater than zero".to_string(),
            ));
        }
        if self.stale_threshold.is_zero() {
            return Err(HearthError::Config(
                "stale threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update for [`RefreshConfig`]; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct RefreshConfigUpdate {
    pub interval: Option<Duration>,
    pub enable_auto_refresh: Option<bool>,
    pub stale_threshold: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub enable_smart_refresh: Option<bool>,
}

impl RefreshConfigUpdate {
    fn apply(self, config: &mut RefreshConfig) {
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(enabled) = self.enable_auto_refresh {
            config.enable_auto_refresh = enabled;
        }
        if let Some(threshold) = self.stale_threshold {
            config.stale_threshold = threshold;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(delay) = self.retry_delay {
            config.retry_delay = delay;
        }
        if let Some(enabled) = self.enable_smart_refresh {
            config.enable_smart_refresh = enabled;
        }
    }
}

/// Lifecycle notification emitted by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    Started {
        forced: bool,
    },
    /// A cycle finished; `changed` is false when smart refresh skipped the fetch
    Completed {
        changed: bool,
        duration: Duration,
    },
    /// Every attempt of a cycle failed
    Failed {
        attempts: u32,
        error: String,
    },
    DataChanged {
        signature: DataChangeSignature,
    },
    /// The coordinator wrote a new dataset version to the cache
    CacheUpdated {
        key: String,
        signature: DataChangeSignature,
    },
}

impl RefreshEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshEvent::Started { .. } => "started",
            RefreshEvent::Completed { .. } => "completed",
            RefreshEvent::Failed { .. } => "failed",
            RefreshEvent::DataChanged { .. } => "data_changed",
            RefreshEvent::CacheUpdated { .. } => "cache_updated",
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    periodic: Option<TimerHandle>,
}

// Lock order: lifecycle, then config, then status.
struct CoordinatorInner {
    cache: DataCache<FamilyData>,
    source: Arc<dyn FamilyDataSource>,
    scheduler: Arc<dyn Scheduler>,
    config: Mutex<RefreshConfig>,
    lifecycle: Mutex<Lifecycle>,
    status: Mutex<StatusTracker>,
    signature: Mutex<Option<DataChangeSignature>>,
    dependents: Mutex<Vec<Arc<dyn PatternInvalidator>>>,
    listeners: Listeners<RefreshEvent>,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(periodic) = lifecycle.periodic.take() {
            periodic.cancel();
        }
    }
}

/// Marks a refresh as in flight until dropped
struct InFlight {
    coordinator: RefreshCoordinator,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.coordinator.tracker().exit();
    }
}

/// Shared, cloneable handle to the refresh coordinator
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub fn new(
        cache: DataCache<FamilyData>,
        source: Arc<dyn FamilyDataSource>,
        scheduler: Arc<dyn Scheduler>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                source,
                scheduler,
                config: Mutex::new(config),
                lifecycle: Mutex::new(Lifecycle::default()),
                status: Mutex::new(StatusTracker::default()),
                signature: Mutex::new(None),
                dependents: Mutex::new(Vec::new()),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn cache(&self) -> &DataCache<FamilyData> {
        &self.inner.cache
    }

    pub fn config(&self) -> RefreshConfig {
        lock(&self.inner.config).clone()
    }

    pub fn status(&self) -> RefreshStatus {
        self.tracker().snapshot()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.lifecycle).running
    }

    /// Also clear matching keys in `store` on a forced refresh
    pub fn register_dependent(&self, store: Arc<dyn PatternInvalidator>) {
        lock(&self.inner.dependents).push(store);
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RefreshEvent) -> Result<(), HearthError> + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Run one refresh now and, if auto refresh is enabled, every `interval` after.
    ///
    /// Only an installed periodic timer makes this a no-op. Without auto
    /// refresh every call runs another immediate cycle.
    pub async fn start(&self) {
        let config = self.config();
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.periodic.is_some() {
                warn!("Refresh coordinator already started");
                return;
            }
            lifecycle.running = true;
            if config.enable_auto_refresh {
                lifecycle.periodic = Some(self.install_periodic(config.interval));
            }
        }

        if config.enable_auto_refresh {
            self.tracker()
                .set_next_refresh(Some(after(Utc::now(), config.interval)));
        }

        info!(
            source = self.inner.source.name(),
            auto_refresh = config.enable_auto_refresh,
            interval_secs = config.interval.as_secs(),
            smart_refresh = config.enable_smart_refresh,
            "Refresh coordinator started"
        );

        self.refresh_family_data(false).await;
    }

    /// Cancel the periodic timer. Safe to call when not running.
    pub fn stop(&self) {
        let was_running = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if let Some(periodic) = lifecycle.periodic.take() {
                periodic.cancel();
            }
            std::mem::replace(&mut lifecycle.running, false)
        };
        self.tracker().set_next_refresh(None);

        if was_running {
            info!("Refresh coordinator stopped");
        }
    }

    /// Read the dataset through the cache, fetching (with retries) on a miss.
    ///
    /// The cache does not time the retry cycle as a whole; `fetch_once`
    /// bounds each attempt.
    pub async fn get_family_data(&self, force_refresh: bool) -> Option<FamilyData> {
        if force_refresh {
            self.inner
                .cache
                .invalidate(FAMILY_DATA_KEY, EvictionReason::Manual);
        }
        let ttl = self.config().stale_threshold;
        self.inner
            .cache
            .get_with_timeout(FAMILY_DATA_KEY, self.tracked_fetch(), Some(ttl), None)
            .await
    }

    /// Clear every key derived from the dataset, then run a forced cycle
    pub async fn force_refresh(&self) -> Option<FamilyData> {
        let mut removed = self
            .inner
            .cache
            .invalidate_pattern(&RELATED_KEYS, EvictionReason::ForcedRefresh);

        let dependents = lock(&self.inner.dependents).clone();
        for store in dependents {
            removed += store.invalidate_matching(&RELATED_KEYS, EvictionReason::ForcedRefresh);
        }

        info!(removed, "Forced refresh, related keys invalidated");
        self.refresh_family_data(true).await
    }

    /// Fetch the dataset bypassing the cache and compare its signature with the
    /// last one seen. The first call always reports a change.
    pub async fn detect_data_changes(&self) -> bool {
        self.check_for_changes().await.0
    }

    /// One refresh cycle.
    ///
    /// Without `force`, a cycle that finds another one in flight returns the
    /// cached value immediately. Failures leave the previous cache entry in place.
    pub async fn refresh_family_data(&self, force: bool) -> Option<FamilyData> {
        let Some(guard) = self.try_enter(force) else {
            debug!("Refresh already in progress, skipping");
            return self.inner.cache.peek(FAMILY_DATA_KEY);
        };

        let started = Instant::now();
        self.emit(RefreshEvent::Started { forced: force });
        let config = self.config();

        let mut checked = None;
        if config.enable_smart_refresh && !force {
            let (changed, data) = self.check_for_changes().await;
            let cached = self.inner.cache.peek(FAMILY_DATA_KEY);
            if !changed && cached.is_some() {
                info!("No data changes detected, skipping refresh");
                self.complete(guard, started, false);
                return cached;
            }
            checked = data;
        }

        let fetched = match checked {
            Some(data) => Ok(data),
            None => self.fetch_with_retries().await,
        };

        match fetched {
            Ok(data) => {
                let version =
                    self.inner
                        .cache
                        .set(FAMILY_DATA_KEY, data.clone(), Some(config.stale_threshold));
                let signature = self.remember_signature(&data).1;
                debug!(version, "Family data cached");

                self.complete(guard, started, true);
                self.emit(RefreshEvent::CacheUpdated {
                    key: FAMILY_DATA_KEY.to_string(),
                    signature,
                });
                Some(data)
            }
            Err(e) => {
                self.fail(guard, &e);
                None
            }
        }
    }

    /// Run one refresh cycle after `delay`, independent of the periodic timer
    pub fn schedule_refresh(&self, delay: Duration) -> TimerHandle {
        let weak = Arc::downgrade(&self.inner);
        let work = async move {
            if let Some(coordinator) = upgrade(&weak) {
                coordinator.refresh_family_data(false).await;
            }
        }
        .boxed();

        debug!(delay_secs = delay.as_secs_f64(), "One-shot refresh scheduled");
        self.inner.scheduler.schedule_once(delay, work)
    }

    /// Merge `update` into the config. A changed interval restarts a running
    /// coordinator so the new period applies immediately.
    pub async fn update_config(&self, update: RefreshConfigUpdate) {
        let interval_changed = {
            let mut config = lock(&self.inner.config);
            let previous = config.interval;
            update.apply(&mut config);
            config.interval != previous
        };

        info!(interval_changed, "Refresh config updated");

        if interval_changed && self.is_running() {
            self.stop();
            self.start().await;
        }
    }

    fn tracker(&self) -> MutexGuard<'_, StatusTracker> {
        lock(&self.inner.status)
    }

    fn emit(&self, event: RefreshEvent) {
        self.inner.listeners.emit(&event);
    }

    fn try_enter(&self, force: bool) -> Option<InFlight> {
        {
            let mut tracker = self.tracker();
            if !force && tracker.in_flight() > 0 {
                return None;
            }
            tracker.enter();
        }
        Some(InFlight {
            coordinator: self.clone(),
        })
    }

    fn enter(&self) -> InFlight {
        self.tracker().enter();
        InFlight {
            coordinator: self.clone(),
        }
    }

    fn install_periodic(&self, interval: Duration) -> TimerHandle {
        let weak = Arc::downgrade(&self.inner);
        let task: Task = Arc::new(move || {
            let weak = weak.clone();
            async move {
                let Some(coordinator) = upgrade(&weak) else {
                    return;
                };
                coordinator
                    .tracker()
                    .set_next_refresh(Some(after(Utc::now(), interval)));
                coordinator.refresh_family_data(false).await;
            }
            .boxed()
        });
        self.inner.scheduler.schedule_repeating(interval, task)
    }

    /// Fetch callback handed to the cache: a full tracked cycle with retries
    fn tracked_fetch(&self) -> RefreshFn<FamilyData> {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            async move {
                match upgrade(&weak) {
                    Some(coordinator) => coordinator.run_tracked().await,
                    None => Err(HearthError::Internal(
                        "refresh coordinator dropped".to_string(),
                    )),
                }
            }
            .boxed()
        })
    }

    async fn run_tracked(&self) -> Result<FamilyData, HearthError> {
        let guard = self.enter();
        let started = Instant::now();
        self.emit(RefreshEvent::Started { forced: false });

        match self.fetch_with_retries().await {
            Ok(data) => {
                let changed = self.remember_signature(&data).0;
                self.complete(guard, started, changed);
                Ok(data)
            }
            Err(e) => {
                self.fail(guard, &e);
                Err(e)
            }
        }
    }

    /// Fetch once, bounded by the cache's fetch timeout
    async fn fetch_once(&self) -> Result<FamilyData, HearthError> {
        let fetch = self.inner.source.fetch();
        match self.inner.cache.config().fetch_timeout {
            Some(limit) => timeout(limit, fetch)
                .await
                .map_err(|_| HearthError::Timeout(limit))?,
            None => fetch.await,
        }
    }

    /// Up to `1 + max_retries` attempts with a fixed pause between them
    async fn fetch_with_retries(&self) -> Result<FamilyData, HearthError> {
        let RefreshConfig {
            max_retries,
            retry_delay,
            ..
        } = self.config();
        let attempts = max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(retry_delay).await;
            }

            match self.fetch_once().await {
                Ok(data) => {
                    if attempt > 0 {
                        info!(attempt, "Family data fetch recovered after retry");
                    }
                    return Ok(data);
                }
                Err(e) => {
                    warn!(
                        source = self.inner.source.name(),
                        attempt,
                        max_retries,
                        error = %e,
                        "Family data fetch failed"
                    );
                    last_error = e.to_string();
                    self.tracker().record_error(last_error.clone(), attempt, Utc::now());
                }
            }
        }

        Err(HearthError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// Fetch once and compare signatures. A failed fetch counts as a change.
    async fn check_for_changes(&self) -> (bool, Option<FamilyData>) {
        match self.fetch_once().await {
            Ok(data) => {
                let (changed, signature) = self.remember_signature(&data);
                if changed {
                    debug!(
                        members = signature.members,
                        todos = signature.todos,
                        checksum = %signature.checksum,
                        "Family data changed"
                    );
                    self.emit(RefreshEvent::DataChanged { signature });
                }
                (changed, Some(data))
            }
            Err(e) => {
                warn!(error = %e, "Change detection fetch failed, assuming data changed");
                (true, None)
            }
        }
    }

    /// Store the signature of `data`, returning whether it differed from the last one
    fn remember_signature(&self, data: &FamilyData) -> (bool, DataChangeSignature) {
        let signature = DataChangeSignature::compute(data);
        let mut stored = lock(&self.inner.signature);
        let changed = stored.as_ref() != Some(&signature);
        if changed {
            *stored = Some(signature.clone());
        }
        (changed, signature)
    }

    fn complete(&self, guard: InFlight, started: Instant, changed: bool) {
        drop(guard);
        self.tracker().complete_cycle(Utc::now());

        let duration = started.elapsed();
        info!(
            changed,
            duration_ms = duration.as_millis() as u64,
            "Refresh cycle completed"
        );
        self.emit(RefreshEvent::Completed { changed, duration });
    }

    fn fail(&self, guard: InFlight, err: &HearthError) {
        drop(guard);
        self.tracker().complete_cycle(Utc::now());

        let attempts = match err {
            HearthError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        };
        error!(attempts, error = %err, "Refresh cycle failed");
        self.emit(RefreshEvent::Failed {
            attempts,
            error: err.to_string(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn upgrade(weak: &Weak<CoordinatorInner>) -> Option<RefreshCoordinator> {
    weak.upgrade().map(|inner| RefreshCoordinator { inner })
}
