//! Property tests for the dispatch invariants that hold for any input.

use meshrpc_core::{EntityId, PeerId, SimTick};
use meshrpc_rpc::{
    is_persistence_eligible, CorrelationId, CorrelationTracker, DeferredQueue, DeferredRpcEntry,
    DeliveryReport, RpcDiagnostics, RpcEnvelope, RpcError, RpcId, RpcMetadata, TargetRule,
    TargetSet, MAX_TARGETS,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn entry(entity: u32, now: Duration) -> DeferredRpcEntry {
    let envelope = RpcEnvelope {
        rpc_id: RpcId::of("Crate", "nudge"),
        entity_id: EntityId(entity),
        payload: Vec::new(),
        correlation_id: None,
        originator: PeerId(2),
        tick: SimTick::ZERO,
        replayed: false,
    };
    DeferredRpcEntry::new(envelope, PeerId(2), PeerId(1), true, now)
}

fn any_rule() -> impl Strategy<Value = TargetRule> {
    prop_oneof![
        Just(TargetRule::Owner),
        Just(TargetRule::All),
        Just(TargetRule::Others),
        Just(TargetRule::SingleAuthority),
        Just(TargetRule::MultipleAuthorities),
    ]
}

proptest! {
    /// Property: A target set never exceeds the cap and never repeats a peer
    #[test]
    fn target_set_is_bounded_and_unique(peers in prop::collection::vec(any::<u16>(), 0..300)) {
        let set = TargetSet::from_peers(peers.iter().copied().map(PeerId));
        let unique: BTreeSet<u16> = peers.iter().copied().collect();

        prop_assert!(set.len() <= MAX_TARGETS);
        prop_assert_eq!(set.len(), unique.len().min(MAX_TARGETS));
        prop_assert_eq!(set.truncated() > 0, unique.len() > MAX_TARGETS);
        let seen: BTreeSet<PeerId> = set.iter().collect();
        prop_assert_eq!(seen.len(), set.len());
    }

    /// Property: Explicit peer-id rules are never replayed to late joiners
    #[test]
    fn explicit_peer_rules_never_persist(rule in any_rule(), persistent in any::<bool>()) {
        let mut metadata = RpcMetadata::targeted(rule);
        if persistent {
            metadata = metadata.persistent();
        }
        prop_assert_eq!(is_persistence_eligible(&metadata), rule.is_category());
        prop_assert!(!is_persistence_eligible(&RpcMetadata::authority_directed().persistent()));
    }

    /// Property: An entry is attempted at most once per tick
    #[test]
    fn entries_attempted_once_per_tick(count in 1usize..40, tick in 1u64..1000) {
        let mut queue = DeferredQueue::new(Duration::from_secs(10), 600);
        for entity in 0..count {
            queue.enqueue(entry(entity as u32, Duration::ZERO));
        }

        let tick = SimTick(tick);
        let now = Duration::from_millis(100);
        let (ready, first) = queue.drain_due(tick, now, |_| true);
        prop_assert_eq!(first.attempted, count);

        // The handler is still missing; everything goes back.
        for entry in ready {
            queue.enqueue(entry);
        }
        let (again, second) = queue.drain_due(tick, now, |_| true);
        prop_assert!(again.is_empty());
        prop_assert_eq!(second.skipped_this_tick, count);

        let (next, third) = queue.drain_due(tick.advance(1), now, |_| true);
        prop_assert_eq!(next.len(), count);
        prop_assert_eq!(third.attempted, count);
    }

    /// Property: Cancelling an entity removes exactly its entries
    #[test]
    fn cancel_removes_only_that_entity(entities in prop::collection::vec(0u32..8, 0..64), victim in 0u32..8) {
        let mut queue = DeferredQueue::new(Duration::from_secs(10), 600);
        for entity in &entities {
            queue.enqueue(entry(*entity, Duration::ZERO));
        }

        let expected = entities.iter().filter(|e| **e == victim).count();
        prop_assert_eq!(queue.cancel_entity(EntityId(victim)), expected);
        prop_assert!(!queue.contains_entity(EntityId(victim)));
        prop_assert_eq!(queue.len(), entities.len() - expected);
        prop_assert!(queue.entries().all(|e| e.entity_id != EntityId(victim)));
    }

    /// Property: A correlation resolves exactly once, whatever races it
    #[test]
    fn correlation_resolves_exactly_once(
        deliveries in 1usize..5,
        expire_first in any::<bool>(),
    ) {
        let diagnostics = Arc::new(RpcDiagnostics::default());
        let tracker = CorrelationTracker::new(diagnostics.clone());
        let id: CorrelationId = tracker.next_id();
        let mut future = tracker.register_report(id, Duration::ZERO, Duration::from_secs(5));

        let mut resolutions = 0;
        if expire_first {
            resolutions += tracker.expire(Duration::from_secs(6));
        }
        for _ in 0..deliveries {
            if tracker.resolve_report(id, Ok(DeliveryReport::default())) {
                resolutions += 1;
            }
        }
        resolutions += tracker.expire(Duration::from_secs(60));

        prop_assert_eq!(resolutions, 1);
        prop_assert_eq!(tracker.pending_count(), 0);
        let outcome = future.try_take();
        if expire_first {
            let timed_out = matches!(outcome, Some(Err(RpcError::DeliveryTimeout { .. })));
            prop_assert!(timed_out);
        } else {
            prop_assert_eq!(outcome, Some(Ok(DeliveryReport::default())));
        }
        prop_assert_eq!(diagnostics.snapshot().late_resolutions as usize, deliveries - usize::from(!expire_first));
    }
}
