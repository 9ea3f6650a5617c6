//! Target resolution: metadata plus call-site arguments to a bounded peer list.

use crate::error::RpcError;
use crate::host::{EntityDirectory, NetworkEntity};
use crate::metadata::{RegisteredRpc, RpcKind, TargetRule};
use crate::MAX_TARGETS;
use meshrpc_core::PeerId;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Ordered, de-duplicated peer list capped at [`MAX_TARGETS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    peers: Vec<PeerId>,
    truncated: usize,
}

impl TargetSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from peers, truncating past the cap.
    pub fn from_peers<I: IntoIterator<Item = PeerId>>(peers: I) -> Self {
        let mut set = Self::new();
        set.extend(peers);
        set
    }

    /// Append `peer` unless already present. Peers past the cap are counted
    /// and dropped.
    pub fn push(&mut self, peer: PeerId) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        if self.peers.len() >= MAX_TARGETS {
            self.truncated += 1;
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Append many peers.
    pub fn extend<I: IntoIterator<Item = PeerId>>(&mut self, peers: I) {
        for peer in peers {
            self.push(peer);
        }
    }

    /// Remove `peer` if present.
    pub fn remove(&mut self, peer: PeerId) {
        self.peers.retain(|p| *p != peer);
    }

    /// Whether `peer` is in the set.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers dropped because the set was full.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Peers in resolution order.
    pub fn as_slice(&self) -> &[PeerId] {
        &self.peers
    }

    /// Iterate in resolution order.
    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }
}

type AccessorFn = dyn Fn(&dyn NetworkEntity, &mut TargetSet) -> bool + Send + Sync;

/// Named property on an entity type that yields targets.
#[derive(Clone)]
pub struct TargetAccessor {
    multi: bool,
    read: Arc<AccessorFn>,
}

impl fmt::Debug for TargetAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetAccessor")
            .field("multi", &self.multi)
            .finish_non_exhaustive()
    }
}

impl TargetAccessor {
    /// Accessor returning one peer.
    pub fn single<E, F>(read: F) -> Self
    where
        E: NetworkEntity,
        F: Fn(&E) -> PeerId + Send + Sync + 'static,
    {
        Self {
            multi: false,
            read: Arc::new(move |entity: &dyn NetworkEntity, out: &mut TargetSet| {
                let Some(entity) = entity.as_any().downcast_ref::<E>() else {
                    return false;
                };
                out.push(read(entity));
                true
            }),
        }
    }

    /// Accessor filling a set of peers.
    pub fn multi<E, F>(read: F) -> Self
    where
        E: NetworkEntity,
        F: Fn(&E, &mut TargetSet) + Send + Sync + 'static,
    {
        Self {
            multi: true,
            read: Arc::new(move |entity: &dyn NetworkEntity, out: &mut TargetSet| {
                let Some(entity) = entity.as_any().downcast_ref::<E>() else {
                    return false;
                };
                read(entity, out);
                true
            }),
        }
    }

    /// Whether this accessor yields many peers.
    pub fn is_multi(&self) -> bool {
        self.multi
    }
}

/// Resolves concrete destinations for an RPC call.
#[derive(Debug, Default)]
pub struct TargetResolver {
    accessors: HashMap<(String, String), TargetAccessor>,
}

impl TargetResolver {
    /// Resolver with no accessors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the accessor backing `entity_type.property`.
    pub fn register_accessor(&mut self, entity_type: &str, property: &str, accessor: TargetAccessor) {
        self.accessors
            .insert((entity_type.to_string(), property.to_string()), accessor);
    }

    /// Resolve the destinations of `rpc` invoked on `entity`.
    pub fn resolve(
        &self,
        entity: &dyn NetworkEntity,
        rpc: &RegisteredRpc,
        first_arg: Option<&dyn Any>,
        directory: &dyn EntityDirectory,
    ) -> Result<TargetSet, RpcError> {
        let mut targets = TargetSet::new();
        let metadata = &rpc.metadata;

        let rule = match metadata.kind {
            RpcKind::AuthorityDirected => {
                targets.push(directory.authority_peer());
                return Ok(targets);
            }
            RpcKind::Broadcast => TargetRule::All,
            RpcKind::ExplicitTarget => metadata.target_rule,
        };

        match rule {
            TargetRule::Owner => {
                targets.push(entity.owner());
            }
            TargetRule::All => push_all(&mut targets, directory),
            TargetRule::Others => {
                push_all(&mut targets, directory);
                targets.remove(entity.owner());
            }
            TargetRule::SingleAuthority | TargetRule::MultipleAuthorities => {
                let invalid = |reason: &str| RpcError::InvalidTargetSpecification {
                    method: rpc.qualified_name(),
                    reason: reason.to_string(),
                };
                let arg = first_arg.ok_or_else(|| invalid("call has no target argument"))?;
                if let Some(peer) = arg.downcast_ref::<PeerId>() {
                    targets.push(*peer);
                } else if let Some(peers) = arg.downcast_ref::<Vec<PeerId>>() {
                    targets.extend(peers.iter().copied());
                } else if let Some(set) = arg.downcast_ref::<TargetSet>() {
                    targets.extend(set.iter());
                } else {
                    return Err(invalid(
                        "first argument must be a PeerId, Vec<PeerId> or TargetSet",
                    ));
                }
            }
            TargetRule::PropertyDerived => {
                let property = metadata.target_property.as_deref().unwrap_or_default();
                let accessor = self
                    .accessors
                    .get(&(rpc.entity_type.clone(), property.to_string()))
                    .ok_or_else(|| RpcError::InvalidTargetSpecification {
                        method: rpc.qualified_name(),
                        reason: format!("no accessor registered for property '{property}'"),
                    })?;
                if accessor.is_multi() != metadata.is_multi_target {
                    return Err(RpcError::InvalidTargetSpecification {
                        method: rpc.qualified_name(),
                        reason: format!(
                            "accessor '{property}' is {} but the RPC is declared {}",
                            shape(accessor.is_multi()),
                            shape(metadata.is_multi_target)
                        ),
                    });
                }
                if !(accessor.read)(entity, &mut targets) {
                    return Err(RpcError::InvalidTargetSpecification {
                        method: rpc.qualified_name(),
                        reason: format!(
                            "accessor '{property}' does not apply to {}",
                            entity.type_name()
                        ),
                    });
                }
            }
        }

        if targets.truncated() > 0 {
            warn!(
                rpc = %rpc.qualified_name(),
                kept = targets.len(),
                dropped = targets.truncated(),
                "Target list exceeds MAX_TARGETS; extra peers dropped"
            );
        }

        Ok(targets)
    }
}

fn shape(multi: bool) -> &'static str {
    if multi {
        "multi-target"
    } else {
        "single-target"
    }
}

fn push_all(targets: &mut TargetSet, directory: &dyn EntityDirectory) {
    targets.push(directory.local_peer());
    if directory.is_authority() {
        targets.extend(directory.connected_peers());
    }
}
