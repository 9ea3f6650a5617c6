//! Wire messages exchanged between peers.
//!
//! Arguments travel as an opaque postcard payload; envelopes only carry ids.

use crate::metadata::RpcId;
use meshrpc_core::{EntityId, PeerId, SimTick};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Invocation of an RPC on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Registered RPC.
    pub rpc_id: RpcId,
    /// Target entity.
    pub entity_id: EntityId,
    /// Encoded argument tuple.
    pub payload: Vec<u8>,
    /// Present when the caller awaits a response.
    pub correlation_id: Option<u64>,
    /// Peer that issued the call.
    pub originator: PeerId,
    /// Tick the call was issued on.
    pub tick: SimTick,
    /// Replay of a persistent RPC to a late joiner.
    pub replayed: bool,
}

/// Explicit-target call forwarded to the authority for validation and routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedRpcEnvelope {
    /// The call itself.
    pub envelope: RpcEnvelope,
    /// Targets as resolved by the originator.
    pub targets: Vec<PeerId>,
    /// Authority re-resolves the category rule with its own peer list.
    pub expand_to_all: bool,
    /// Originator already executed the call locally.
    pub executed_by_originator: bool,
    /// Delivery report correlation, if the originator awaits one.
    pub report_correlation: Option<u64>,
    /// Read-only validation scenario for the cache.
    pub scenario_key: Option<String>,
}

/// Outcome of an awaited RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation of the original call.
    pub correlation_id: u64,
    /// Encoded return value or failure description.
    pub result: Result<Vec<u8>, String>,
}

/// Which resolved targets actually received an explicit-target RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Targets the RPC was delivered to.
    pub delivered_to: Vec<PeerId>,
    /// Targets denied by validation.
    pub failed_delivery: Vec<PeerId>,
    /// Validator's denial reason.
    pub failure_reason: Option<String>,
    /// Validator rewrote the payload.
    pub was_modified: bool,
    /// Validator announced a follow-up response.
    pub expect_follow_on_response: bool,
}

impl DeliveryReport {
    /// Whether every resolved target received the RPC.
    pub fn fully_delivered(&self) -> bool {
        self.failed_delivery.is_empty()
    }
}

/// Delivery report routed back to a remote caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReportMessage {
    /// Correlation of the routed call.
    pub correlation_id: u64,
    /// The report, or the reason routing failed.
    pub report: Result<DeliveryReport, String>,
}

/// Every message the RPC layer puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Execute on the receiver.
    Invoke(RpcEnvelope),
    /// Validate and route (authority only).
    Routed(RoutedRpcEnvelope),
    /// Reply to an awaited invoke.
    Response(RpcResponse),
    /// Reply to a routed call that requested a report.
    DeliveryReport(DeliveryReportMessage),
}

impl RpcMessage {
    /// Short label for logs and traffic records.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcMessage::Invoke(_) => "invoke",
            RpcMessage::Routed(_) => "routed",
            RpcMessage::Response(_) => "response",
            RpcMessage::DeliveryReport(_) => "delivery_report",
        }
    }
}
