//! Error taxonomy for the RPC core.

use crate::metadata::RpcId;
use meshrpc_core::{EntityId, PeerId};
use std::time::Duration;
use thiserror::Error;

/// Errors produced while registering, issuing or delivering RPCs.
///
/// `TargetNotReady` and `HandlerNotRegistered` are recoverable: the dispatcher
/// turns them into a deferral instead of surfacing them to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    // Recoverable delivery signals

    /// Target entity does not exist locally yet
    #[error("Target {entity_id} is not ready for RPC {rpc_id}")]
    TargetNotReady {
        entity_id: EntityId,
        rpc_id: RpcId,
    },

    /// No handler registered for the RPC (component not initialised yet)
    #[error("No handler registered for RPC {rpc_id}")]
    HandlerNotRegistered {
        rpc_id: RpcId,
    },

    // Caller errors

    /// Target rule could not be resolved from the call-site arguments
    #[error("Invalid target specification for {method}: {reason}")]
    InvalidTargetSpecification {
        method: String,
        reason: String,
    },

    /// No RPC registered under this (entity type, method) pair
    #[error("RPC {entity_type}.{method} is not registered")]
    UnknownRpc {
        entity_type: String,
        method: String,
    },

    /// Caller named an entity the local directory does not know
    #[error("{entity_id} does not exist on this peer")]
    EntityNotFound {
        entity_id: EntityId,
    },

    /// No RPC registered under this wire id
    #[error("RPC id {rpc_id} is not registered")]
    UnknownRpcId {
        rpc_id: RpcId,
    },

    /// Operation does not apply to this kind of RPC
    #[error("{operation} is not supported for {method}")]
    UnsupportedOperation {
        method: String,
        operation: &'static str,
    },

    /// Caller does not own the entity of an owner-only RPC
    #[error("{peer} does not own {entity_id}")]
    NotOwner {
        peer: PeerId,
        entity_id: EntityId,
    },

    // Registration errors

    /// Two registered methods hash to the same wire id
    #[error("RPC id {rpc_id} for {incoming} collides with {existing}")]
    RpcIdCollision {
        rpc_id: RpcId,
        existing: String,
        incoming: String,
    },

    /// Same (entity type, method) registered twice with different metadata
    #[error("RPC {entity_type}.{method} is already registered with different metadata")]
    AlreadyRegistered {
        entity_type: String,
        method: String,
    },

    /// Handler or validator parameter count differs from the registration
    #[error("Arity mismatch for RPC {rpc_id}: registered {expected}, got {actual}")]
    ArityMismatch {
        rpc_id: RpcId,
        expected: usize,
        actual: usize,
    },

    // Runtime failures

    /// Validator panicked or could not decode its arguments
    #[error("Validator for RPC {rpc_id} failed: {message}")]
    ValidatorFault {
        rpc_id: RpcId,
        message: String,
    },

    /// Asynchronous call was not resolved in time
    #[error("Correlation {correlation_id} timed out after {after:?}")]
    DeliveryTimeout {
        correlation_id: u64,
        after: Duration,
    },

    /// Deferred RPC gave up waiting for its entity
    #[error("Deferred RPC {rpc_id} for {entity_id} exhausted {retries} retries")]
    RetryExhausted {
        rpc_id: RpcId,
        entity_id: EntityId,
        retries: u32,
    },

    /// Deferred RPC exceeded its wall-clock ceiling
    #[error("Deferred RPC {rpc_id} for {entity_id} timed out after {age:?}")]
    DeferredTimeout {
        rpc_id: RpcId,
        entity_id: EntityId,
        age: Duration,
    },

    /// Argument or message (de)serialisation failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Transport refused a publish
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote handler reported a failure
    #[error("Remote RPC failed: {0}")]
    Remote(String),

    /// Continuation was dropped without being resolved
    #[error("Pending RPC was dropped before it resolved")]
    ContinuationDropped,
}

impl From<postcard::Error> for RpcError {
    fn from(err: postcard::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}
