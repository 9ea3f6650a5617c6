//! RPC dispatch, validation, deferred-retry and correlation engine for
//! peer-authoritative networked entities.
//!
//! The [`RpcEngine`] is driven from the simulation thread. Network receipt may
//! happen elsewhere and is handed over through an [`InboundSender`]; the
//! engine drains it on every [`RpcEngine::tick`].

mod args;
mod codec;
mod config;
mod context;
mod correlation;
mod deferred;
mod diagnostics;
mod engine;
mod error;
mod handlers;
mod host;
mod loopback;
mod metadata;
mod persistence;
mod pool;
mod protocol;
mod targets;
mod validation;

#[cfg(test)]
mod test_support;

pub use args::RpcArgs;
pub use codec::{decode_args, decode_message, encode_args, encode_message, message_type_tag};
pub use config::RpcConfig;
pub use context::{RpcContext, ValidationContext};
pub use correlation::{CorrelationId, CorrelationTracker, DeliveryReportFuture, ResponseFuture};
pub use deferred::{DeferredPassReport, DeferredPayload, DeferredQueue, DeferredRpcEntry};
pub use diagnostics::{DiagnosticsSnapshot, RpcDiagnostics};
pub use engine::{CallOptions, CallSummary, InboundSender, RpcEngine};
pub use error::RpcError;
pub use handlers::{HandlerOutcome, HandlerResult};
pub use host::{Clock, EntityDirectory, NetworkEntity, Transport};
pub use loopback::{LocalDirectory, LoopbackNetwork, LoopbackTransport, SentMessage};
pub use metadata::{RegisteredRpc, RelayMode, RpcId, RpcKind, RpcMetadata, RpcRegistry, TargetRule};
pub use persistence::{is_persistence_eligible, PersistentRpcRecord, PersistentRpcStore};
pub use pool::{Pool, Pooled, Reset};
pub use protocol::{
    DeliveryReport, DeliveryReportMessage, RoutedRpcEnvelope, RpcEnvelope, RpcMessage,
    RpcResponse,
};
pub use targets::{TargetAccessor, TargetResolver, TargetSet};
pub use validation::{ValidationEngine, ValidationResult};

/// Upper bound on the number of peers a single RPC resolves to.
pub const MAX_TARGETS: usize = 64;

/// Largest supported RPC parameter count.
pub const MAX_RPC_ARITY: usize = 8;
