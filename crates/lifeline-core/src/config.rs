//! Tunables for the coordinator and the degradation service.
//!
//! Both sections deserialize from the `[coordinator]` and `[degradation]`
//! tables of `lifeline.toml`; every field has a default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue capacity. Fixed policy, not configurable.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Entries evicted from the front of a full queue before an append.
pub const EVICTION_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Attempts per transaction, at least 1.
    pub retry_attempts: u32,
    /// Continue with the document store alone when the graph store is down.
    pub graceful_degradation: bool,
    /// Fail writes whenever the graph store cannot take part.
    pub graph_store_required: bool,
    /// Backoff unit; attempt `n` waits `n * base_retry_delay_ms` before retrying.
    pub base_retry_delay_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            graceful_degradation: true,
            graph_store_required: false,
            base_retry_delay_ms: 1000,
        }
    }
}

impl CoordinatorConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retry_attempts == 0 {
            return Err("coordinator.retry_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub graph_health_check_interval_ms: u64,
    pub doc_health_check_interval_ms: u64,
    /// Failed replays allowed before an entry is dropped for good.
    pub max_retry_attempts: u32,
    /// Entries replayed per drain.
    pub sync_batch_size: usize,
    pub enable_background_sync: bool,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            graph_health_check_interval_ms: 30_000,
            doc_health_check_interval_ms: 10_000,
            max_retry_attempts: 3,
            sync_batch_size: 100,
            enable_background_sync: true,
        }
    }
}

impl DegradationConfig {
    pub fn graph_health_check_interval(&self) -> Duration {
        Duration::from_millis(self.graph_health_check_interval_ms)
    }

    pub fn doc_health_check_interval(&self) -> Duration {
        Duration::from_millis(self.doc_health_check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.graph_health_check_interval_ms == 0 || self.doc_health_check_interval_ms == 0 {
            return Err("degradation health check intervals must be positive".to_string());
        }
        if self.sync_batch_size == 0 {
            return Err("degradation.sync_batch_size must be at least 1".to_string());
        }
        if self.max_retry_attempts == 0 {
            return Err("degradation.max_retry_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}
