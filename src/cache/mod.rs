//! Cache module for hearth.
//!
//! This module provides the caching infrastructure:
//! - A generic in-memory store with stale-while-revalidate reads
//! - A refresh coordinator that keeps the family dataset current
//! - Change detection through lightweight data signatures
//! - Event listeners for metrics and diagnostics

pub mod coordinator;
pub mod entry;
pub mod events;
pub mod scheduler;
pub mod signature;
pub mod status;
pub mod store;

pub use coordinator::{
    RefreshConfig, RefreshConfigUpdate, RefreshCoordinator, RefreshEvent, FAMILY_DATA_KEY,
    RELATED_KEYS,
};
pub use entry::{CacheEntry, EntryInfo};
pub use events::{CacheEvent, EvictionReason, ListenerId};
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use signature::DataChangeSignature;
pub use status::{RefreshErrorRecord, RefreshStatus};
pub use store::{refresh_fn, CacheConfig, CacheStats, DataCache, PatternInvalidator, RefreshFn};
