//! Event notifications for cache and refresh observers.
//!
//! Listeners are plain closures kept in registration order. Delivery is
//! synchronous; a listener that returns an error or panics is logged and
//! skipped, and delivery continues with the next listener.

use crate::error::HearthError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, warn};

/// Why an entry left the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionReason {
    /// Evicted to make room for a new key
    MemoryPressure,
    /// Found expired on read or by the cleanup sweep
    TtlExpired,
    /// Removed by an explicit caller request
    Manual,
    /// Removed by a forced dataset refresh
    ForcedRefresh,
    /// Removed by `clear`
    Cleared,
    /// Removed while shutting the cache down
    Disposed,
    /// Caller-supplied reason
    Other(String),
}

impl EvictionReason {
    pub fn as_str(&self) -> &str {
        match self {
            EvictionReason::MemoryPressure => "memory_pressure",
            EvictionReason::TtlExpired => "ttl_expired",
            EvictionReason::Manual => "manual",
            EvictionReason::ForcedRefresh => "forced_refresh",
            EvictionReason::Cleared => "cleared",
            EvictionReason::Disposed => "disposed",
            EvictionReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification emitted by a [`DataCache`](crate::cache::DataCache)
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit {
        key: String,
    },
    Miss {
        key: String,
    },
    /// A fetch stored a new version of the key
    Refresh {
        key: String,
        version: u64,
        background: bool,
    },
    /// A direct `set` stored a new version of the key
    Write {
        key: String,
        version: u64,
        ttl: Duration,
    },
    Eviction {
        key: String,
        reason: EvictionReason,
    },
}

impl CacheEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Hit { .. } => "hit",
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::Refresh { .. } => "refresh",
            CacheEvent::Write { .. } => "write",
            CacheEvent::Eviction { .. } => "eviction",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Hit { key }
            | CacheEvent::Miss { key }
            | CacheEvent::Refresh { key, .. }
            | CacheEvent::Write { key, .. }
            | CacheEvent::Eviction { key, .. } => key,
        }
    }
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered event callback
pub type Listener<E> = Arc<dyn Fn(&E) -> Result<(), HearthError> + Send + Sync>;

/// Ordered listener registry
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E: fmt::Debug> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener; it receives every event emitted after this call
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) -> Result<(), HearthError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener, returning whether it was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Deliver an event to every listener in registration order
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners can (un)register without deadlocking
        let snapshot: Vec<(ListenerId, Listener<E>)> = self.lock().clone();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = ?id, event = ?event, error = %e, "Event listener failed");
                }
                Err(_) => {
                    error!(listener = ?id, event = ?event, "Event listener panicked");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener<E>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: fmt::Debug> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
