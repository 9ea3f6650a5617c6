//! Persistence policy and the late-joiner replay store.

use crate::metadata::{RpcId, RpcKind, RpcMetadata, TargetRule};
use crate::protocol::RpcEnvelope;
use meshrpc_core::{EntityId, PeerId};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Property-name fragments that read as a group of peers rather than a
/// specific peer.
const CATEGORY_HINTS: [&str; 8] = [
    "team", "group", "room", "party", "squad", "channel", "faction", "guild",
];

/// Whether an RPC with `metadata` may be retained and replayed to peers that
/// join later.
///
/// Explicit peer ids are never replayable: the addressed peers may be gone by
/// the time someone joins.
pub fn is_persistence_eligible(metadata: &RpcMetadata) -> bool {
    match metadata.kind {
        RpcKind::AuthorityDirected => false,
        RpcKind::Broadcast => true,
        RpcKind::ExplicitTarget => match metadata.target_rule {
            TargetRule::Owner | TargetRule::All | TargetRule::Others => true,
            TargetRule::SingleAuthority | TargetRule::MultipleAuthorities => false,
            TargetRule::PropertyDerived => metadata
                .target_property
                .as_deref()
                .is_some_and(is_category_property),
        },
    }
}

fn is_category_property(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    CATEGORY_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Retained invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentRpcRecord {
    /// Insertion order; replay follows it.
    pub sequence: u64,
    /// The call as originally issued.
    pub envelope: RpcEnvelope,
    /// Kind the RPC was registered with.
    pub kind: RpcKind,
    /// Category rule resolved at record time.
    pub target_rule: TargetRule,
    /// Entity owner when the call fired.
    pub owner: PeerId,
    /// Reliable channel.
    pub reliable: bool,
}

/// One record per `(entity, rpc)` logical event, newest wins.
#[derive(Debug, Default)]
pub struct PersistentRpcStore {
    records: BTreeMap<u64, PersistentRpcRecord>,
    latest: HashMap<(EntityId, RpcId), u64>,
    next_sequence: u64,
}

impl PersistentRpcStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `envelope` if `metadata` is persistent and eligible. Returns
    /// whether a record was stored.
    pub fn record(&mut self, metadata: &RpcMetadata, envelope: &RpcEnvelope, owner: PeerId) -> bool {
        if !metadata.is_persistent || !is_persistence_eligible(metadata) {
            return false;
        }

        let key = (envelope.entity_id, envelope.rpc_id);
        if let Some(previous) = self.latest.remove(&key) {
            self.records.remove(&previous);
            debug!(entity = %envelope.entity_id, rpc_id = %envelope.rpc_id, "Superseded persistent RPC");
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let target_rule = match metadata.kind {
            RpcKind::Broadcast => TargetRule::All,
            _ => metadata.target_rule,
        };
        self.records.insert(
            sequence,
            PersistentRpcRecord {
                sequence,
                envelope: RpcEnvelope {
                    replayed: true,
                    correlation_id: None,
                    ..envelope.clone()
                },
                kind: metadata.kind,
                target_rule,
                owner,
                reliable: metadata.is_reliable,
            },
        );
        self.latest.insert(key, sequence);
        true
    }

    /// Drop every record of `entity_id`.
    pub fn remove_entity(&mut self, entity_id: EntityId) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.envelope.entity_id != entity_id);
        self.latest.retain(|(entity, _), _| *entity != entity_id);
        before - self.records.len()
    }

    /// Records in the order they were issued.
    pub fn records(&self) -> impl Iterator<Item = &PersistentRpcRecord> + '_ {
        self.records.values()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
