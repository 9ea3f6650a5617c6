//! Handler table keyed by [`RpcId`].
//!
//! Typed handlers are erased into one callable shape taking the encoded
//! argument tuple, so every arity shares the same dispatch path.

use crate::args::RpcArgs;
use crate::codec::{decode_args, encode_value};
use crate::context::RpcContext;
use crate::error::RpcError;
use crate::host::NetworkEntity;
use crate::metadata::{RegisteredRpc, RpcId};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What a handler reports back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome<T = ()> {
    /// The call ran; `T` is returned to an awaiting caller.
    Ready(T),
    /// The component the call needs is not initialised yet; retry later.
    NotYetReady,
}

/// Return type of RPC handlers.
pub type HandlerResult<T = ()> = anyhow::Result<HandlerOutcome<T>>;

/// Result of an erased invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Invocation {
    Ready(Vec<u8>),
    NotYetReady,
    Failed(String),
}

pub(crate) type ErasedHandler =
    dyn Fn(&RpcContext, &dyn NetworkEntity, &[u8]) -> Invocation + Send + Sync;

#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: HashMap<RpcId, Arc<ErasedHandler>>,
}

impl HandlerTable {
    pub fn register<E, A, R, F>(&mut self, rpc: &RegisteredRpc, handler: F) -> Result<(), RpcError>
    where
        E: NetworkEntity,
        A: RpcArgs,
        R: Serialize + 'static,
        F: Fn(&RpcContext, &E, A) -> HandlerResult<R> + Send + Sync + 'static,
    {
        if A::ARITY != rpc.arity {
            return Err(RpcError::ArityMismatch {
                rpc_id: rpc.id,
                expected: rpc.arity,
                actual: A::ARITY,
            });
        }

        let erased = move |ctx: &RpcContext, entity: &dyn NetworkEntity, payload: &[u8]| {
            let Some(entity) = entity.as_any().downcast_ref::<E>() else {
                return Invocation::Failed(format!(
                    "handler does not accept entity type {}",
                    entity.type_name()
                ));
            };
            let args: A = match decode_args(payload) {
                Ok(args) => args,
                Err(err) => return Invocation::Failed(err.to_string()),
            };

            match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, entity, args))) {
                Ok(Ok(HandlerOutcome::Ready(value))) => match encode_value(&value) {
                    Ok(bytes) => Invocation::Ready(bytes),
                    Err(err) => Invocation::Failed(err.to_string()),
                },
                Ok(Ok(HandlerOutcome::NotYetReady)) => Invocation::NotYetReady,
                Ok(Err(err)) => Invocation::Failed(format!("{err:#}")),
                Err(payload) => {
                    Invocation::Failed(format!("handler panicked: {}", panic_message(&*payload)))
                }
            }
        };

        self.handlers.insert(rpc.id, Arc::new(erased));
        Ok(())
    }

    pub fn get(&self, id: RpcId) -> Option<Arc<ErasedHandler>> {
        self.handlers.get(&id).cloned()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
