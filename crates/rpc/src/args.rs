//! Arity table for RPC parameter lists.
//!
//! Every RPC takes its parameters as a tuple. The tuple is serialised as one
//! payload, so dispatch, validation and deferral never need to know how many
//! values it holds; only registration compares [`RpcArgs::ARITY`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;

/// Parameter list of an RPC: `()` or a tuple of up to eight values.
pub trait RpcArgs: Serialize + DeserializeOwned + Send + 'static {
    /// Number of parameters.
    const ARITY: usize;

    /// First parameter, used by targeting rules that read the call-site
    /// argument.
    fn first_arg(&self) -> Option<&dyn Any>;
}

impl RpcArgs for () {
    const ARITY: usize = 0;

    fn first_arg(&self) -> Option<&dyn Any> {
        None
    }
}

macro_rules! impl_rpc_args {
    ($arity:expr; $first:ident $(, $rest:ident)*) => {
        impl<$first, $($rest),*> RpcArgs for ($first, $($rest,)*)
        where
            $first: Serialize + DeserializeOwned + Send + 'static,
            $($rest: Serialize + DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $arity;

            fn first_arg(&self) -> Option<&dyn Any> {
                Some(&self.0)
            }
        }
    };
}

impl_rpc_args!(1; A);
impl_rpc_args!(2; A, B);
impl_rpc_args!(3; A, B, C);
impl_rpc_args!(4; A, B, C, D);
impl_rpc_args!(5; A, B, C, D, E);
impl_rpc_args!(6; A, B, C, D, E, F);
impl_rpc_args!(7; A, B, C, D, E, F, G);
impl_rpc_args!(8; A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_RPC_ARITY;
    use meshrpc_core::PeerId;

    #[test]
    fn arity_follows_tuple_width() {
        assert_eq!(<() as RpcArgs>::ARITY, 0);
        assert_eq!(<(u8,) as RpcArgs>::ARITY, 1);
        assert_eq!(<(u8, String, bool) as RpcArgs>::ARITY, 3);
        assert_eq!(
            <(u8, u8, u8, u8, u8, u8, u8, u8) as RpcArgs>::ARITY,
            MAX_RPC_ARITY
        );
    }

    #[test]
    fn first_arg_downcasts() {
        let args = (PeerId(7), String::from("hi"));
        let first = args.first_arg().unwrap();
        assert_eq!(first.downcast_ref::<PeerId>(), Some(&PeerId(7)));
        assert!(().first_arg().is_none());
    }
}
