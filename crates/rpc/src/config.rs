//! Engine tunables, loadable from the host configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the RPC engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Wall-clock ceiling for a deferred RPC, in milliseconds.
    pub deferred_timeout_ms: u64,
    /// Retry passes a deferred RPC may spend waiting for its entity.
    pub deferred_max_retries: u32,
    /// Timeout for `call_rpc_async` responses, in milliseconds.
    pub response_timeout_ms: u64,
    /// Timeout for delivery reports, in milliseconds.
    pub delivery_report_timeout_ms: u64,
    /// Lifetime of a cached read-only validation, in milliseconds.
    pub validation_cache_ttl_ms: u64,
    /// Idle allowed-target buffers kept for reuse.
    pub validation_pool_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            // 600 retries at 60 Hz is roughly the 10s ceiling
            deferred_timeout_ms: 10_000,
            deferred_max_retries: 600,
            response_timeout_ms: 30_000,
            delivery_report_timeout_ms: 5_000,
            validation_cache_ttl_ms: 30_000,
            validation_pool_size: 32,
        }
    }
}

impl RpcConfig {
    /// Deferred wall-clock ceiling.
    pub fn deferred_timeout(&self) -> Duration {
        Duration::from_millis(self.deferred_timeout_ms)
    }

    /// Async response timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Delivery report timeout.
    pub fn delivery_report_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_report_timeout_ms)
    }

    /// Validation cache TTL.
    pub fn validation_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.validation_cache_ttl_ms)
    }
}
