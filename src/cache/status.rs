//! Refresh status accounting for the coordinator.
//!
//! Tracks whether a refresh is in flight, when the last one finished, a
//! bounded log of recent failures and a rolling success rate.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Failures kept in the status log
pub const MAX_ERROR_RECORDS: usize = 10;

/// Attempts considered by the success-rate approximation
const SUCCESS_WINDOW: u64 = 10;

/// One failed fetch attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Zero for the first attempt of a cycle
    pub retry_count: u32,
}

/// Public snapshot of the coordinator's refresh state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStatus {
    pub is_refreshing: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub next_refresh: Option<DateTime<Utc>>,
    /// Oldest first, at most [`MAX_ERROR_RECORDS`]
    pub errors: VecDeque<RefreshErrorRecord>,
    pub refresh_count: u64,
    /// In [0, 1]
    pub success_rate: f64,
}

impl Default for RefreshStatus {
    fn default() -> Self {
        Self {
            is_refreshing: false,
            last_refresh: None,
            next_refresh: None,
            errors: VecDeque::with_capacity(MAX_ERROR_RECORDS),
            refresh_count: 0,
            success_rate: 1.0,
        }
    }
}

impl RefreshStatus {
    /// Whether the last completed cycle is older than `threshold` (or never ran)
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match self.last_refresh {
            Some(last) => now - last > to_chrono(threshold),
            None => true,
        }
    }
}

/// Mutable tracker behind the coordinator's status lock
#[derive(Debug, Default)]
pub(crate) struct StatusTracker {
    status: RefreshStatus,
    in_flight: usize,
}

impl StatusTracker {
    pub fn snapshot(&self) -> RefreshStatus {
        self.status.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn enter(&mut self) {
        self.in_flight += 1;
        self.status.is_refreshing = true;
    }

    pub fn exit(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.status.is_refreshing = self.in_flight > 0;
    }

    pub fn record_error(&mut self, message: String, retry_count: u32, now: DateTime<Utc>) {
        if self.status.errors.len() >= MAX_ERROR_RECORDS {
            self.status.errors.pop_front();
        }
        self.status.errors.push_back(RefreshErrorRecord {
            timestamp: now,
            message,
            retry_count,
        });
    }

    /// Close out one refresh cycle, successful or not
    pub fn complete_cycle(&mut self, now: DateTime<Utc>) {
        self.status.refresh_count += 1;
        self.status.last_refresh = Some(now);
        self.status.success_rate = self.rolling_success_rate(now);
    }

    pub fn set_next_refresh(&mut self, next: Option<DateTime<Utc>>) {
        self.status.next_refresh = next;
    }

    /// `(attempts - errors in the last hour) / attempts`, where attempts is
    /// the cycle count modulo the window (a full window when it wraps to 0).
    fn rolling_success_rate(&self, now: DateTime<Utc>) -> f64 {
        let recent_attempts = match self.status.refresh_count % SUCCESS_WINDOW {
            0 => SUCCESS_WINDOW,
            n => n,
        }
        .max(1);

        let hour_ago = now - ChronoDuration::hours(1);
        let recent_errors = self
            .status
            .errors
            .iter()
            .filter(|record| record.timestamp > hour_ago)
            .count() as u64;

        let succeeded = recent_attempts.saturating_sub(recent_errors);
        (succeeded as f64 / recent_attempts as f64).clamp(0.0, 1.0)
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::max_value())
}

/// `now + duration`, saturating instead of overflowing
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(duration)).unwrap_or(now)
}
