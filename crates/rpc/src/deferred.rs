//! Deferred retry queue for RPCs whose target entity or handler is missing.
//!
//! Entries live in a slab with a free list so slots are reused. Each entry is
//! reachable from the flat retry list and from a per-entity index; both are
//! updated together so destroying an entity removes all its entries at once.
//! The queue is owned by the simulation thread and is never shared.

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::metadata::RpcId;
use crate::protocol::RpcEnvelope;
use meshrpc_core::{EntityId, PeerId, SimTick};
use std::collections::HashMap;
use std::time::Duration;

/// Deferred invocation; persistent replays keep their own variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredPayload {
    /// Regular call.
    Transient(RpcEnvelope),
    /// Replay of a persistent record to a late joiner.
    Persistent(RpcEnvelope),
}

impl DeferredPayload {
    /// Wrap `envelope`, choosing the variant from its replay flag.
    pub fn from_envelope(envelope: RpcEnvelope) -> Self {
        if envelope.replayed {
            DeferredPayload::Persistent(envelope)
        } else {
            DeferredPayload::Transient(envelope)
        }
    }

    /// The wrapped envelope.
    pub fn envelope(&self) -> &RpcEnvelope {
        match self {
            DeferredPayload::Transient(envelope) | DeferredPayload::Persistent(envelope) => envelope,
        }
    }

    /// Unwrap the envelope.
    pub fn into_envelope(self) -> RpcEnvelope {
        match self {
            DeferredPayload::Transient(envelope) | DeferredPayload::Persistent(envelope) => envelope,
        }
    }

    /// Whether this is a persistent replay.
    pub fn is_persistent(&self) -> bool {
        matches!(self, DeferredPayload::Persistent(_))
    }
}

/// One parked RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredRpcEntry {
    /// The call.
    pub payload: DeferredPayload,
    /// Peer the call came from.
    pub source: PeerId,
    /// Peer that will execute it (the local peer).
    pub target_peer: PeerId,
    /// Entity the call waits for.
    pub entity_id: EntityId,
    /// When the call was first deferred.
    pub enqueued_at: Duration,
    /// Retry passes that found the entity missing.
    pub retry_count: u32,
    /// Tick of the last delivery attempt; `None` until the first one.
    pub last_attempted_tick: Option<SimTick>,
    /// Arrived on the reliable channel.
    pub reliable: bool,
}

impl DeferredRpcEntry {
    /// Fresh entry for `envelope`, deferred at `now`.
    pub fn new(envelope: RpcEnvelope, source: PeerId, target_peer: PeerId, reliable: bool, now: Duration) -> Self {
        Self {
            entity_id: envelope.entity_id,
            payload: DeferredPayload::from_envelope(envelope),
            source,
            target_peer,
            enqueued_at: now,
            retry_count: 0,
            last_attempted_tick: None,
            reliable,
        }
    }

    /// RPC the entry carries.
    pub fn rpc_id(&self) -> RpcId {
        self.payload.envelope().rpc_id
    }
}

/// Outcome of one retry pass.
#[derive(Debug, Default)]
pub struct DeferredPassReport {
    /// Entries handed back for delivery.
    pub attempted: usize,
    /// Entries skipped because they were already attempted this tick.
    pub skipped_this_tick: usize,
    /// Entries dropped on the wall-clock ceiling.
    pub timed_out: Vec<RpcError>,
    /// Entries dropped on the retry ceiling.
    pub exhausted: Vec<RpcError>,
}

/// Pending deferred RPCs.
#[derive(Debug)]
pub struct DeferredQueue {
    slots: Vec<Option<DeferredRpcEntry>>,
    free: Vec<usize>,
    retry_list: Vec<usize>,
    by_entity: HashMap<EntityId, Vec<usize>>,
    timeout: Duration,
    max_retries: u32,
}

impl DeferredQueue {
    /// Queue with explicit limits.
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            retry_list: Vec::new(),
            by_entity: HashMap::new(),
            timeout,
            max_retries,
        }
    }

    /// Queue using the configured limits.
    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(config.deferred_timeout(), config.deferred_max_retries)
    }

    /// Park `entry`.
    pub fn enqueue(&mut self, entry: DeferredRpcEntry) {
        let entity_id = entry.entity_id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.retry_list.push(slot);
        self.by_entity.entry(entity_id).or_default().push(slot);
    }

    /// Number of parked entries.
    pub fn len(&self) -> usize {
        self.retry_list.len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.retry_list.is_empty()
    }

    /// Whether any entry waits for `entity_id`.
    pub fn contains_entity(&self, entity_id: EntityId) -> bool {
        self.by_entity.contains_key(&entity_id)
    }

    /// Parked entries in retry order.
    pub fn entries(&self) -> impl Iterator<Item = &DeferredRpcEntry> + '_ {
        self.retry_list
            .iter()
            .filter_map(|slot| self.slots.get(*slot).and_then(Option::as_ref))
    }

    /// Remove every entry waiting for `entity_id`.
    pub fn cancel_entity(&mut self, entity_id: EntityId) -> usize {
        let Some(slots) = self.by_entity.remove(&entity_id) else {
            return 0;
        };
        self.retry_list.retain(|slot| !slots.contains(slot));
        for slot in &slots {
            self.slots[*slot] = None;
            self.free.push(*slot);
        }
        slots.len()
    }

    /// One retry pass.
    ///
    /// Entries already attempted on `tick` are left alone. Expired entries
    /// are dropped, entries whose entity now exists are removed and returned
    /// for delivery, and the rest count a retry.
    pub fn drain_due<F>(&mut self, tick: SimTick, now: Duration, entity_exists: F) -> (Vec<DeferredRpcEntry>, DeferredPassReport)
    where
        F: Fn(EntityId) -> bool,
    {
        let mut ready = Vec::new();
        let mut report = DeferredPassReport::default();
        let pending = std::mem::take(&mut self.retry_list);
        let mut keep = Vec::with_capacity(pending.len());

        for slot in pending {
            let Some(entry) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
                continue;
            };

            if entry.last_attempted_tick == Some(tick) {
                report.skipped_this_tick += 1;
                keep.push(slot);
                continue;
            }

            let age = now.saturating_sub(entry.enqueued_at);
            if age > self.timeout {
                report.timed_out.push(RpcError::DeferredTimeout {
                    rpc_id: entry.rpc_id(),
                    entity_id: entry.entity_id,
                    age,
                });
                self.release(slot);
                continue;
            }

            if entity_exists(entry.entity_id) {
                entry.last_attempted_tick = Some(tick);
                if let Some(entry) = self.release(slot) {
                    report.attempted += 1;
                    ready.push(entry);
                }
                continue;
            }

            entry.retry_count += 1;
            if entry.retry_count > self.max_retries {
                report.exhausted.push(RpcError::RetryExhausted {
                    rpc_id: entry.rpc_id(),
                    entity_id: entry.entity_id,
                    retries: entry.retry_count,
                });
                self.release(slot);
                continue;
            }

            keep.push(slot);
        }

        self.retry_list = keep;
        (ready, report)
    }

    /// Take `slot` out of the slab and the entity index. The caller owns the
    /// retry list.
    fn release(&mut self, slot: usize) -> Option<DeferredRpcEntry> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        if let Some(slots) = self.by_entity.get_mut(&entry.entity_id) {
            slots.retain(|s| *s != slot);
            if slots.is_empty() {
                self.by_entity.remove(&entry.entity_id);
            }
        }
        Some(entry)
    }
}
