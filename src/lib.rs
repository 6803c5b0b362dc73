//! Hearth - family data cache and refresh service
//!
//! An in-process caching layer for an aggregated family dataset with:
//! - Stale-while-revalidate reads with single-flight background refresh
//! - A refresh coordinator with change detection and fixed-delay retries
//! - Event listeners feeding Prometheus metrics

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod services;
pub mod utils;
