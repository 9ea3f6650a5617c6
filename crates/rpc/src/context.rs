//! Per-call context handed to handlers and validators.
//!
//! A context only exists for the duration of one invocation; handlers receive
//! it by reference and cannot retain it.

use crate::host::NetworkEntity;
use crate::metadata::RpcId;
use meshrpc_core::{EntityId, PeerId, SimTick};

/// Execution context of an RPC handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcContext {
    /// Peer that issued the call.
    pub source: PeerId,
    /// Peer executing the handler.
    pub local: PeerId,
    /// Arrived on the reliable channel.
    pub is_reliable: bool,
    /// Entity the RPC targets.
    pub entity_id: EntityId,
    /// RPC being executed.
    pub rpc_id: RpcId,
    /// Tick the call was issued on.
    pub tick: SimTick,
    /// Correlation the caller awaits, if any.
    pub correlation_id: Option<u64>,
    /// Replay of a persistent RPC to a late joiner.
    pub is_replay: bool,
}

impl RpcContext {
    /// Whether the call originated on this peer.
    pub fn is_from_me(&self) -> bool {
        self.source == self.local
    }
}

/// Input of a validator run.
pub struct ValidationContext<'a> {
    /// Peer that issued the call.
    pub source: PeerId,
    /// Peer running validation (the authority).
    pub local: PeerId,
    /// Resolved targets, indexed like the result bitmap.
    pub targets: &'a [PeerId],
    /// Entity the RPC targets.
    pub entity: &'a dyn NetworkEntity,
    /// RPC being validated.
    pub rpc_id: RpcId,
}

impl ValidationContext<'_> {
    /// Index of `peer` in the target list.
    pub fn target_index(&self, peer: PeerId) -> Option<usize> {
        self.targets.iter().position(|p| *p == peer)
    }
}
