//! Prometheus metrics for monitoring hearth.
//!
//! Counters are fed by cache and refresh events through their listener
//! registries; gauges are refreshed from stats snapshots on a timer.

use crate::cache::{CacheEvent, CacheStats, RefreshEvent, RefreshStatus};
use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};
use std::sync::Arc;
use tracing::error;

/// All metrics for the hearth service
pub struct Metrics {
    pub registry: Registry,

    // Cache metrics
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub cache_refreshes_total: CounterVec,
    pub cache_writes_total: Counter,
    pub cache_evictions_total: CounterVec,
    pub cache_entries: Gauge,
    pub cache_hit_rate: Gauge,

    // Refresh metrics
    pub refresh_cycles_total: CounterVec,
    pub refresh_data_changes_total: Counter,
    pub refresh_success_rate: Gauge,
    pub refresh_errors: Gauge,
    pub refresh_in_progress: Gauge,

    // System metrics
    pub uptime_seconds: Gauge,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Cache metrics
        let cache_hits_total = Counter::with_opts(Opts::new(
            "hearth_cache_hits_total",
            "Reads served from a live cache entry",
        ))?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = Counter::with_opts(Opts::new(
            "hearth_cache_misses_total",
            "Reads that found no live cache entry",
        ))?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let cache_refreshes_total = CounterVec::new(
            Opts::new(
                "hearth_cache_refreshes_total",
                "Entries stored by a fetch, by mode",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(cache_refreshes_total.clone()))?;

        let cache_writes_total = Counter::with_opts(Opts::new(
            "hearth_cache_writes_total",
            "Entries stored by a direct write",
        ))?;
        registry.register(Box::new(cache_writes_total.clone()))?;

        let cache_evictions_total = CounterVec::new(
            Opts::new(
                "hearth_cache_evictions_total",
                "Entries removed from the cache, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(cache_evictions_total.clone()))?;

        let cache_entries = Gauge::with_opts(Opts::new(
            "hearth_cache_entries",
            "Resident cache entries",
        ))?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_hit_rate = Gauge::with_opts(Opts::new(
            "hearth_cache_hit_rate",
            "Fraction of reads served from cache",
        ))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;

        // Refresh metrics
        let refresh_cycles_total = CounterVec::new(
            Opts::new(
                "hearth_refresh_cycles_total",
                "Completed refresh cycles, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(refresh_cycles_total.clone()))?;

        let refresh_data_changes_total = Counter::with_opts(Opts::new(
            "hearth_refresh_data_changes_total",
            "Detected changes of the family dataset",
        ))?;
        registry.register(Box::new(refresh_data_changes_total.clone()))?;

        let refresh_success_rate = Gauge::with_opts(Opts::new(
            "hearth_refresh_success_rate",
            "Rolling refresh success rate",
        ))?;
        registry.register(Box::new(refresh_success_rate.clone()))?;

        let refresh_errors = Gauge::with_opts(Opts::new(
            "hearth_refresh_errors",
            "Failed attempts in the refresh error log",
        ))?;
        registry.register(Box::new(refresh_errors.clone()))?;

        let refresh_in_progress = Gauge::with_opts(Opts::new(
            "hearth_refresh_in_progress",
            "Whether a refresh cycle is running (0 or 1)",
        ))?;
        registry.register(Box::new(refresh_in_progress.clone()))?;

        // System metrics
        let uptime_seconds = Gauge::with_opts(Opts::new(
            "hearth_uptime_seconds",
            "Service uptime in seconds",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            cache_hits_total,
            cache_misses_total,
            cache_refreshes_total,
            cache_writes_total,
            cache_evictions_total,
            cache_entries,
            cache_hit_rate,
            refresh_cycles_total,
            refresh_data_changes_total,
            refresh_success_rate,
            refresh_errors,
            refresh_in_progress,
            uptime_seconds,
        })
    }

    /// Record a cache event
    pub fn observe_cache_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Hit { .. } => self.cache_hits_total.inc(),
            CacheEvent::Miss { .. } => self.cache_misses_total.inc(),
            CacheEvent::Refresh { background, .. } => {
                let mode = if *background { "background" } else { "inline" };
                self.cache_refreshes_total.with_label_values(&[mode]).inc();
            }
            CacheEvent::Write { .. } => self.cache_writes_total.inc(),
            CacheEvent::Eviction { reason, .. } => {
                self.cache_evictions_total
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
        }
    }

    /// Record a refresh coordinator event
    pub fn observe_refresh_event(&self, event: &RefreshEvent) {
        match event {
            RefreshEvent::Completed { changed, .. } => {
                let outcome = if *changed { "updated" } else { "unchanged" };
                self.refresh_cycles_total.with_label_values(&[outcome]).inc();
            }
            RefreshEvent::Failed { .. } => {
                self.refresh_cycles_total.with_label_values(&["failed"]).inc();
            }
            RefreshEvent::DataChanged { .. } => self.refresh_data_changes_total.inc(),
            RefreshEvent::Started { .. } | RefreshEvent::CacheUpdated { .. } => {}
        }
    }

    /// Update cache gauges from a stats snapshot
    pub fn update_cache_metrics(&self, stats: &CacheStats) {
        self.cache_entries.set(stats.size as f64);
        self.cache_hit_rate.set(stats.hit_rate);
    }

    /// Update refresh gauges from a status snapshot
    pub fn update_refresh_metrics(&self, status: &RefreshStatus) {
        self.refresh_success_rate.set(status.success_rate);
        self.refresh_errors.set(status.errors.len() as f64);
        self.refresh_in_progress
            .set(if status.is_refreshing { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(Metrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionReason;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        let output = metrics.render();
        assert!(output.contains("hearth_cache_entries"));
        assert!(output.contains("hearth_refresh_success_rate"));
    }

    #[test]
    fn test_cache_event_recording() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_cache_event(&CacheEvent::Hit {
            key: "family_data".to_string(),
        });
        metrics.observe_cache_event(&CacheEvent::Refresh {
            key: "family_data".to_string(),
            version: 2,
            background: true,
        });
        metrics.observe_cache_event(&CacheEvent::Eviction {
            key: "ai_summary".to_string(),
            reason: EvictionReason::ForcedRefresh,
        });

        assert_eq!(metrics.cache_hits_total.get(), 1.0);
        assert_eq!(
            metrics
                .cache_refreshes_total
                .with_label_values(&["background"])
                .get(),
            1.0
        );
        let output = metrics.render();
        assert!(output.contains("reason=\"forced_refresh\""));
    }

    #[test]
    fn test_refresh_event_recording() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_refresh_event(&RefreshEvent::Completed {
            changed: false,
            duration: Duration::from_millis(20),
        });
        metrics.observe_refresh_event(&RefreshEvent::Failed {
            attempts: 4,
            error: "offline".to_string(),
        });

        let cycles = &metrics.refresh_cycles_total;
        assert_eq!(cycles.with_label_values(&["unchanged"]).get(), 1.0);
        assert_eq!(cycles.with_label_values(&["failed"]).get(), 1.0);

        let status = RefreshStatus {
            is_refreshing: true,
            ..RefreshStatus::default()
        };
        metrics.update_refresh_metrics(&status);
        assert_eq!(metrics.refresh_in_progress.get(), 1.0);
        assert_eq!(metrics.refresh_success_rate.get(), 1.0);
    }
}
