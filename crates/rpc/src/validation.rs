//! Validation engine: per-target allow/deny decisions with payload rewrite.
//!
//! Validators are registered by `(entity type, name)` and compiled once per
//! RPC id into an erased callable. Read-only scenarios can be cached for a
//! TTL; a validation that rewrote the payload is never cached.

use crate::args::RpcArgs;
use crate::codec::{decode_args, encode_args};
use crate::context::ValidationContext;
use crate::diagnostics::RpcDiagnostics;
use crate::error::RpcError;
use crate::handlers::panic_message;
use crate::metadata::{RegisteredRpc, RpcId};
use crate::pool::{Pool, Pooled};
use meshrpc_core::PeerId;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Per-target decision of one validation run.
///
/// Every target starts denied; the validator allows what it accepts.
#[derive(Debug)]
pub struct ValidationResult {
    allowed: Pooled<Vec<bool>>,
    modified_payload: Option<Vec<u8>>,
    denial_reason: Option<String>,
    expect_follow_on_response: bool,
}

impl ValidationResult {
    pub(crate) fn new(pool: &Pool<Vec<bool>>, target_count: usize) -> Self {
        let mut allowed = pool.acquire();
        allowed.resize(target_count, false);
        Self {
            allowed,
            modified_payload: None,
            denial_reason: None,
            expect_follow_on_response: false,
        }
    }

    /// Allow every target.
    pub fn allow_all(&mut self) {
        self.allowed.iter_mut().for_each(|slot| *slot = true);
    }

    /// Deny every target.
    pub fn deny_all(&mut self) {
        self.allowed.iter_mut().for_each(|slot| *slot = false);
    }

    /// Deny every target and record why.
    pub fn deny_all_with(&mut self, reason: impl Into<String>) {
        self.deny_all();
        self.denial_reason = Some(reason.into());
    }

    /// Allow the target at `index`; out-of-range indices are ignored.
    pub fn allow_target(&mut self, index: usize) {
        if let Some(slot) = self.allowed.get_mut(index) {
            *slot = true;
        }
    }

    /// Deny the target at `index`; out-of-range indices are ignored.
    pub fn deny_target(&mut self, index: usize) {
        if let Some(slot) = self.allowed.get_mut(index) {
            *slot = false;
        }
    }

    /// Record why targets were denied.
    pub fn set_denial_reason(&mut self, reason: impl Into<String>) {
        self.denial_reason = Some(reason.into());
    }

    /// Announce that the targets will receive a follow-up response.
    pub fn expect_follow_on_response(&mut self) {
        self.expect_follow_on_response = true;
    }

    /// Whether the target at `index` is allowed.
    pub fn is_allowed(&self, index: usize) -> bool {
        self.allowed.get(index).copied().unwrap_or(false)
    }

    /// Number of targets covered.
    pub fn target_count(&self) -> usize {
        self.allowed.len()
    }

    /// Number of allowed targets.
    pub fn allowed_count(&self) -> usize {
        self.allowed.iter().filter(|allowed| **allowed).count()
    }

    /// Whether the validator rewrote the arguments.
    pub fn was_modified(&self) -> bool {
        self.modified_payload.is_some()
    }

    /// Rewritten argument payload, if any.
    pub fn modified_payload(&self) -> Option<&[u8]> {
        self.modified_payload.as_deref()
    }

    /// Denial reason, if the validator gave one.
    pub fn denial_reason(&self) -> Option<&str> {
        self.denial_reason.as_deref()
    }

    /// Whether a follow-up response was announced.
    pub fn expects_follow_on_response(&self) -> bool {
        self.expect_follow_on_response
    }

    /// Split `targets` into (allowed, denied), by index.
    pub fn partition(&self, targets: &[PeerId]) -> (Vec<PeerId>, Vec<PeerId>) {
        let mut allowed = Vec::new();
        let mut denied = Vec::new();
        for (index, peer) in targets.iter().enumerate() {
            if self.is_allowed(index) {
                allowed.push(*peer);
            } else {
                denied.push(*peer);
            }
        }
        (allowed, denied)
    }
}

type ErasedValidator = dyn Fn(&ValidationContext<'_>, &[u8], &mut ValidationResult) -> Result<Option<Vec<u8>>, String>
    + Send
    + Sync;

fn erase<F>(call: F) -> Arc<ErasedValidator>
where
    F: Fn(&ValidationContext<'_>, &[u8], &mut ValidationResult) -> Result<Option<Vec<u8>>, String>
        + Send
        + Sync
        + 'static,
{
    Arc::new(call)
}

#[derive(Clone)]
struct CompiledValidator {
    arity: usize,
    call: Arc<ErasedValidator>,
}

struct CachedValidation {
    allowed: Vec<bool>,
    denial_reason: Option<String>,
    expect_follow_on_response: bool,
    cached_at: Duration,
}

#[derive(Default)]
struct ValidationCache {
    entries: HashMap<(RpcId, String), CachedValidation>,
    last_cleanup: Duration,
}

impl ValidationCache {
    /// Drop expired entries, at most once per TTL window.
    fn cleanup(&mut self, now: Duration, ttl: Duration) {
        if now.saturating_sub(self.last_cleanup) < ttl {
            return;
        }
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.cached_at) < ttl);
        self.last_cleanup = now;
        if before != self.entries.len() {
            debug!(evicted = before - self.entries.len(), "Validation cache cleanup");
        }
    }
}

/// Runs validators and owns the validation cache.
pub struct ValidationEngine {
    validators: RwLock<HashMap<(String, String), CompiledValidator>>,
    compiled: Mutex<HashMap<RpcId, CompiledValidator>>,
    cache: Mutex<ValidationCache>,
    pool: Pool<Vec<bool>>,
    ttl: Duration,
    diagnostics: Arc<RpcDiagnostics>,
}

impl ValidationEngine {
    /// Engine with the given cache TTL and idle-buffer pool size.
    pub fn new(ttl: Duration, pool_size: usize, diagnostics: Arc<RpcDiagnostics>) -> Self {
        Self {
            validators: RwLock::new(HashMap::new()),
            compiled: Mutex::new(HashMap::new()),
            cache: Mutex::new(ValidationCache::default()),
            pool: Pool::new(pool_size),
            ttl,
            diagnostics,
        }
    }

    /// Register validator `name` for RPCs of `entity_type` taking `A`.
    ///
    /// The validator may rewrite the arguments in place; the rewrite is
    /// detected and forwarded to the allowed targets.
    pub fn register<A, F>(&self, entity_type: &str, name: &str, validator: F)
    where
        A: RpcArgs,
        F: Fn(&ValidationContext<'_>, &mut A, &mut ValidationResult) + Send + Sync + 'static,
    {
        let call = erase(move |ctx, payload, result| {
            let mut args: A = decode_args(payload).map_err(|err| err.to_string())?;
            panic::catch_unwind(AssertUnwindSafe(|| validator(ctx, &mut args, result)))
                .map_err(|cause| format!("validator panicked: {}", panic_message(&*cause)))?;
            let encoded = encode_args(&args).map_err(|err| err.to_string())?;
            Ok((encoded != payload).then_some(encoded))
        });

        let compiled = CompiledValidator {
            arity: A::ARITY,
            call,
        };
        if let Ok(mut validators) = self.validators.write() {
            validators.insert((entity_type.to_string(), name.to_string()), compiled);
        }
        // Re-registration replaces what earlier RPCs compiled against.
        if let Ok(mut memo) = self.compiled.lock() {
            memo.clear();
        }
    }

    /// Arity of a registered validator.
    pub fn validator_arity(&self, entity_type: &str, name: &str) -> Option<usize> {
        self.validators
            .read()
            .ok()?
            .get(&(entity_type.to_string(), name.to_string()))
            .map(|validator| validator.arity)
    }

    /// Validate a call of `rpc` against `ctx.targets`.
    ///
    /// `connected` is the authority's view of authenticated peers, used by
    /// the default policy when the RPC has no validator.
    pub fn validate(
        &self,
        rpc: &RegisteredRpc,
        ctx: &ValidationContext<'_>,
        payload: &[u8],
        scenario_key: Option<&str>,
        connected: &[PeerId],
        now: Duration,
    ) -> ValidationResult {
        let target_count = ctx.targets.len();

        let Some(name) = rpc.metadata.validator.as_deref() else {
            let mut result = ValidationResult::new(&self.pool, target_count);
            for (index, peer) in ctx.targets.iter().enumerate() {
                if *peer == ctx.local || connected.contains(peer) {
                    result.allow_target(index);
                }
            }
            return result;
        };

        let validator = match self.compile(rpc, name) {
            Ok(validator) => validator,
            Err(err) => return self.degrade(&err, target_count),
        };

        if let Some(key) = scenario_key {
            if let Some(hit) = self.cached(rpc.id, key, target_count, now) {
                RpcDiagnostics::bump(&self.diagnostics.validation_cache_hits);
                return hit;
            }
            RpcDiagnostics::bump(&self.diagnostics.validation_cache_misses);
        }

        let mut result = ValidationResult::new(&self.pool, target_count);
        match (validator.call)(ctx, payload, &mut result) {
            Ok(modified) => result.modified_payload = modified,
            Err(message) => {
                let err = RpcError::ValidatorFault {
                    rpc_id: rpc.id,
                    message,
                };
                return self.degrade(&err, target_count);
            }
        }

        if let Some(key) = scenario_key {
            if !result.was_modified() {
                self.store(rpc.id, key, &result, now);
            }
        }

        result
    }

    /// Number of live cache entries.
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|cache| cache.entries.len()).unwrap_or(0)
    }

    fn compile(&self, rpc: &RegisteredRpc, name: &str) -> Result<CompiledValidator, RpcError> {
        if let Some(compiled) = self.compiled.lock().ok().and_then(|memo| memo.get(&rpc.id).cloned()) {
            return Ok(compiled);
        }

        let validator = self
            .validators
            .read()
            .ok()
            .and_then(|validators| {
                validators
                    .get(&(rpc.entity_type.clone(), name.to_string()))
                    .cloned()
            })
            .ok_or_else(|| RpcError::ValidatorFault {
                rpc_id: rpc.id,
                message: format!("validator '{name}' is not registered"),
            })?;

        if validator.arity != rpc.arity {
            return Err(RpcError::ValidatorFault {
                rpc_id: rpc.id,
                message: RpcError::ArityMismatch {
                    rpc_id: rpc.id,
                    expected: rpc.arity,
                    actual: validator.arity,
                }
                .to_string(),
            });
        }

        if let Ok(mut memo) = self.compiled.lock() {
            memo.insert(rpc.id, validator.clone());
        }
        debug!(rpc_id = %rpc.id, validator = name, "Compiled validator");
        Ok(validator)
    }

    fn degrade(&self, err: &RpcError, target_count: usize) -> ValidationResult {
        error!("{err}; allowing all targets");
        RpcDiagnostics::bump(&self.diagnostics.validator_faults);
        let mut result = ValidationResult::new(&self.pool, target_count);
        result.allow_all();
        result
    }

    fn cached(
        &self,
        rpc_id: RpcId,
        key: &str,
        target_count: usize,
        now: Duration,
    ) -> Option<ValidationResult> {
        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(_) => {
                warn!("Validation cache lock poisoned; bypassing cache");
                return None;
            }
        };
        cache.cleanup(now, self.ttl);

        let entry = cache.entries.get(&(rpc_id, key.to_string()))?;
        if now.saturating_sub(entry.cached_at) >= self.ttl {
            return None;
        }

        let mut result = ValidationResult::new(&self.pool, target_count);
        for (slot, allowed) in result.allowed.iter_mut().zip(&entry.allowed) {
            *slot = *allowed;
        }
        result.denial_reason = entry.denial_reason.clone();
        result.expect_follow_on_response = entry.expect_follow_on_response;
        Some(result)
    }

    fn store(&self, rpc_id: RpcId, key: &str, result: &ValidationResult, now: Duration) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.entries.insert(
                (rpc_id, key.to_string()),
                CachedValidation {
                    allowed: result.allowed.to_vec(),
                    denial_reason: result.denial_reason.clone(),
                    expect_follow_on_response: result.expect_follow_on_response,
                    cached_at: now,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RpcMetadata;
    use crate::test_support::TestEntity;
    use meshrpc_core::EntityId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> ValidationEngine {
        ValidationEngine::new(Duration::from_secs(30), 8, Arc::new(RpcDiagnostics::default()))
    }

    fn rpc(arity: usize, validator: Option<&str>) -> RegisteredRpc {
        let mut metadata = RpcMetadata::targeted(crate::metadata::TargetRule::All);
        metadata.validator = validator.map(str::to_string);
        RegisteredRpc {
            id: RpcId::of("Chat", "say"),
            entity_type: "Chat".into(),
            method: "say".into(),
            arity,
            metadata,
        }
    }

    fn run(
        engine: &ValidationEngine,
        rpc: &RegisteredRpc,
        targets: &[PeerId],
        payload: &[u8],
        key: Option<&str>,
        now: Duration,
    ) -> ValidationResult {
        let entity = TestEntity::new(EntityId(1), "Chat", PeerId(2));
        let ctx = ValidationContext {
            source: PeerId(2),
            local: PeerId(1),
            targets,
            entity: &entity,
            rpc_id: rpc.id,
        };
        engine.validate(rpc, &ctx, payload, key, &[PeerId(2), PeerId(3)], now)
    }

    #[test]
    fn default_policy_allows_local_and_connected() {
        let engine = engine();
        let targets = [PeerId(1), PeerId(2), PeerId(9)];
        let result = run(&engine, &rpc(0, None), &targets, &[], None, Duration::ZERO);
        assert!(result.is_allowed(0));
        assert!(result.is_allowed(1));
        assert!(!result.is_allowed(2));
    }

    #[test]
    fn validator_starts_from_all_denied() {
        let engine = engine();
        engine.register("Chat", "odd_only", |ctx: &ValidationContext<'_>, _: &mut (u8,), result: &mut ValidationResult| {
            for index in 0..ctx.targets.len() {
                if index % 2 == 1 {
                    result.allow_target(index);
                }
            }
        });

        let targets = [PeerId(1), PeerId(2), PeerId(3)];
        let payload = encode_args(&(1u8,)).unwrap();
        let result = run(&engine, &rpc(1, Some("odd_only")), &targets, &payload, None, Duration::ZERO);
        let (allowed, denied) = result.partition(&targets);
        assert_eq!(allowed, vec![PeerId(2)]);
        assert_eq!(denied, vec![PeerId(1), PeerId(3)]);
        assert!(!result.was_modified());
    }

    #[test]
    fn rewrites_are_detected() {
        let engine = engine();
        engine.register("Chat", "censor", |_: &ValidationContext<'_>, args: &mut (String,), result: &mut ValidationResult| {
            args.0 = args.0.replace("darn", "****");
            result.allow_all();
        });

        let targets = [PeerId(2)];
        let payload = encode_args(&(String::from("darn it"),)).unwrap();
        let result = run(&engine, &rpc(1, Some("censor")), &targets, &payload, None, Duration::ZERO);
        assert!(result.was_modified());
        let (text,): (String,) = decode_args(result.modified_payload().unwrap()).unwrap();
        assert_eq!(text, "**** it");
    }

    #[test]
    fn panicking_validator_degrades_to_allow_all() {
        let diagnostics = Arc::new(RpcDiagnostics::default());
        let engine = ValidationEngine::new(Duration::from_secs(30), 8, Arc::clone(&diagnostics));
        engine.register("Chat", "broken", |_: &ValidationContext<'_>, _: &mut (), _: &mut ValidationResult| {
            panic!("validator bug");
        });

        let targets = [PeerId(1), PeerId(9)];
        let payload = encode_args(&()).unwrap();
        let result = run(&engine, &rpc(0, Some("broken")), &targets, &payload, None, Duration::ZERO);
        assert_eq!(result.allowed_count(), 2);
        assert_eq!(diagnostics.snapshot().validator_faults, 1);
    }

    #[test]
    fn arity_mismatch_degrades_to_allow_all() {
        let engine = engine();
        engine.register("Chat", "pair", |_: &ValidationContext<'_>, _: &mut (u8, u8), _: &mut ValidationResult| {});

        let targets = [PeerId(4)];
        let payload = encode_args(&(1u8,)).unwrap();
        let result = run(&engine, &rpc(1, Some("pair")), &targets, &payload, None, Duration::ZERO);
        assert!(result.is_allowed(0));
    }

    #[test]
    fn read_only_scenarios_are_cached_until_ttl() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.register("Chat", "counted", move |_: &ValidationContext<'_>, _: &mut (u8,), result: &mut ValidationResult| {
            counter.fetch_add(1, Ordering::SeqCst);
            result.allow_target(0);
        });

        let meta = rpc(1, Some("counted"));
        let targets = [PeerId(1), PeerId(2)];
        let payload = encode_args(&(5u8,)).unwrap();

        let first = run(&engine, &meta, &targets, &payload, Some("lobby"), Duration::from_secs(1));
        let second = run(&engine, &meta, &targets, &payload, Some("lobby"), Duration::from_secs(20));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.is_allowed(0) && second.is_allowed(0));
        assert!(!second.is_allowed(1));

        run(&engine, &meta, &targets, &payload, Some("lobby"), Duration::from_secs(31));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_hit_is_resized_to_current_targets() {
        let engine = engine();
        engine.register("Chat", "first", |_: &ValidationContext<'_>, _: &mut (u8,), result: &mut ValidationResult| {
            result.allow_target(0);
        });
        let meta = rpc(1, Some("first"));
        let payload = encode_args(&(5u8,)).unwrap();

        run(&engine, &meta, &[PeerId(1)], &payload, Some("k"), Duration::ZERO);
        let grown = run(&engine, &meta, &[PeerId(1), PeerId(2), PeerId(3)], &payload, Some("k"), Duration::from_secs(1));
        assert_eq!(grown.target_count(), 3);
        assert!(grown.is_allowed(0));
        assert!(!grown.is_allowed(2));
    }

    #[test]
    fn modified_results_are_never_cached() {
        let engine = engine();
        engine.register("Chat", "stamp", |_: &ValidationContext<'_>, args: &mut (u8,), result: &mut ValidationResult| {
            args.0 = 99;
            result.allow_all();
        });
        let meta = rpc(1, Some("stamp"));
        let payload = encode_args(&(5u8,)).unwrap();

        let result = run(&engine, &meta, &[PeerId(1)], &payload, Some("k"), Duration::ZERO);
        assert!(result.was_modified());
        assert_eq!(engine.cached_entries(), 0);
    }

    #[test]
    fn expired_entries_are_swept_lazily() {
        let engine = engine();
        engine.register("Chat", "noop", |_: &ValidationContext<'_>, _: &mut (u8,), _: &mut ValidationResult| {});
        let meta = rpc(1, Some("noop"));
        let payload = encode_args(&(5u8,)).unwrap();

        run(&engine, &meta, &[PeerId(1)], &payload, Some("a"), Duration::from_secs(1));
        assert_eq!(engine.cached_entries(), 1);
        run(&engine, &meta, &[PeerId(1)], &payload, Some("b"), Duration::from_secs(40));
        assert_eq!(engine.cached_entries(), 1);
    }

    #[test]
    fn result_buffers_return_to_pool() {
        let engine = engine();
        let meta = rpc(0, None);
        drop(run(&engine, &meta, &[PeerId(1)], &[], None, Duration::ZERO));
        assert_eq!(engine.pool.idle_count(), 1);
    }
}
