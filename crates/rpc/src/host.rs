//! Collaborator interfaces the engine consumes from its host.

use crate::protocol::RpcMessage;
use anyhow::Result;
use meshrpc_core::{EntityId, PeerId, SimTick};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// A networked object RPCs can be addressed to.
pub trait NetworkEntity: Any + Send + Sync {
    /// Stable network id.
    fn id(&self) -> EntityId;

    /// Type name used as the first half of every RPC key.
    fn type_name(&self) -> &str;

    /// Peer owning the entity.
    fn owner(&self) -> PeerId;

    /// Upcast for typed accessors.
    fn as_any(&self) -> &dyn Any;
}

/// Entity lookup and session membership.
pub trait EntityDirectory: Send + Sync {
    /// Find a live entity.
    fn lookup_entity(&self, id: EntityId) -> Option<Arc<dyn NetworkEntity>>;

    /// Whether the local peer is the authority.
    fn is_authority(&self) -> bool;

    /// Id of the local peer.
    fn local_peer(&self) -> PeerId;

    /// Id of the authority.
    fn authority_peer(&self) -> PeerId;

    /// Remote peers currently connected and authenticated.
    fn connected_peers(&self) -> Vec<PeerId>;
}

/// Outbound message bus.
pub trait Transport: Send + Sync {
    /// Publish `message` to `target`, or to every connected peer when `None`.
    fn publish(&self, target: Option<PeerId>, message: RpcMessage, reliable: bool) -> Result<()>;
}

/// Simulation scheduler clock.
pub trait Clock: Send + Sync {
    /// Current simulation tick.
    fn current_tick(&self) -> SimTick;

    /// Elapsed wall-clock time since the session started.
    fn current_time(&self) -> Duration;
}
