//! Counters for failures that have no caller to report to.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters, shared between the engine and its subsystems.
        #[derive(Debug, Default)]
        pub struct RpcDiagnostics {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`RpcDiagnostics`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct DiagnosticsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl RpcDiagnostics {
            /// Copy every counter.
            pub fn snapshot(&self) -> DiagnosticsSnapshot {
                DiagnosticsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// RPCs parked waiting for their entity or handler.
    deferred_enqueued,
    /// Deferred RPCs delivered by a retry pass.
    deferred_delivered,
    /// Deferred RPCs dropped on the wall-clock ceiling.
    deferred_timed_out,
    /// Deferred RPCs dropped on the retry ceiling.
    deferred_retry_exhausted,
    /// Deferred RPCs removed because their entity was destroyed.
    deferred_cancelled,
    /// Validators that panicked, failed to decode or mismatched arity.
    validator_faults,
    /// Validations answered from the cache.
    validation_cache_hits,
    /// Cacheable validations that had to run.
    validation_cache_misses,
    /// Peers dropped by the target cap.
    targets_truncated,
    /// Handlers that failed or panicked.
    handler_failures,
    /// Responses or reports arriving after their correlation resolved.
    late_resolutions,
    /// Correlations resolved by timeout.
    correlation_timeouts,
    /// Persistent records stored.
    persistent_recorded,
    /// Persistent records replayed to late joiners.
    persistent_replayed,
    /// Broadcasts attempted by a non-authority.
    broadcast_rejections,
    /// Calls from non-owners to owner-only RPCs.
    not_owner_rejections,
    /// Calls aborted on an unresolvable target rule.
    invalid_targets,
}

impl RpcDiagnostics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}
