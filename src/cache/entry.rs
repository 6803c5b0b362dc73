//! Cache entries and their diagnostic snapshots.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Smallest TTL an entry may carry, so `expires_at` is always after `timestamp`.
const MIN_TTL: Duration = Duration::from_millis(1);

/// A single cached value with its freshness bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// The cached payload
    pub data: T,
    /// When this version was stored
    pub timestamp: Instant,
    /// When this version stops being served as fresh
    pub expires_at: Instant,
    /// Bumped on every overwrite of the same key, starting at 1
    pub version: u64,
    /// Successful reads since this version was stored
    pub hits: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration, now: Instant, version: u64) -> Self {
        Self {
            data,
            timestamp: now,
            expires_at: now + ttl.max(MIN_TTL),
            version,
            hits: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at.duration_since(self.timestamp)
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// True once the entry has aged past `threshold` (a fraction of its TTL).
    pub fn needs_refresh_at(&self, now: Instant, threshold: f64) -> bool {
        self.age_at(now) > self.ttl().mul_f64(threshold)
    }

    pub fn info_at(&self, now: Instant, threshold: f64) -> EntryInfo {
        EntryInfo {
            age: self.age_at(now),
            ttl: self.ttl(),
            remaining_ttl: self.expires_at.saturating_duration_since(now),
            hits: self.hits,
            version: self.version,
            is_expired: self.is_expired_at(now),
            needs_refresh: self.needs_refresh_at(now, threshold),
        }
    }
}

/// Point-in-time view of an entry, for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    pub age: Duration,
    pub ttl: Duration,
    /// Floored at zero once expired
    pub remaining_ttl: Duration,
    pub hits: u64,
    pub version: u64,
    pub is_expired: bool,
    pub needs_refresh: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ttl_is_clamped() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", Duration::ZERO, now, 1);
        assert!(entry.expires_at > entry.timestamp);
        assert_eq!(entry.ttl(), MIN_TTL);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", Duration::from_millis(100), now, 1);

        assert!(!entry.is_expired_at(now + Duration::from_millis(99)));
        assert!(entry.is_expired_at(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_info_reports_threshold_and_remaining() {
        let now = Instant::now();
        let entry = CacheEntry::new(1u32, Duration::from_millis(100), now, 3);

        let early = entry.info_at(now + Duration::from_millis(50), 0.8);
        assert!(!early.needs_refresh);
        assert_eq!(early.remaining_ttl, Duration::from_millis(50));
        assert_eq!(early.version, 3);

        let late = entry.info_at(now + Duration::from_millis(150), 0.8);
        assert!(late.needs_refresh);
        assert!(late.is_expired);
        assert_eq!(late.remaining_ttl, Duration::ZERO);
    }
}
