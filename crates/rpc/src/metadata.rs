//! RPC metadata registry.
//!
//! Metadata is registered once per `(entity type, method)` pair and is
//! immutable afterwards. The wire never carries names, only the [`RpcId`]
//! derived from them.

use crate::error::RpcError;
use crate::protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Wire identifier of a registered RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RpcId(pub u32);

impl RpcId {
    /// FNV-1a over `entity_type`, `'.'` and `method`.
    pub fn of(entity_type: &str, method: &str) -> Self {
        const FNV_OFFSET: u32 = 2_166_136_261;
        const FNV_PRIME: u32 = 16_777_619;

        let mut hash = FNV_OFFSET;
        let bytes = entity_type
            .as_bytes()
            .iter()
            .chain(b".")
            .chain(method.as_bytes());
        for byte in bytes {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Who may issue an RPC and where it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcKind {
    /// Callable by any peer, executes on the authority.
    AuthorityDirected,
    /// Issued by the authority, executes everywhere.
    Broadcast,
    /// Executes on a resolved set of peers.
    ExplicitTarget,
}

/// How an [`RpcKind::ExplicitTarget`] RPC picks its destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetRule {
    /// The entity's owning peer.
    Owner,
    /// Every peer, local included.
    All,
    /// Every peer except the entity's owner.
    Others,
    /// A single peer id passed as the first argument.
    SingleAuthority,
    /// A collection of peer ids passed as the first argument.
    MultipleAuthorities,
    /// Peers returned by a registered accessor on the entity.
    PropertyDerived,
}

impl TargetRule {
    /// Category rules address "whoever is in the group", not specific peers.
    pub fn is_category(self) -> bool {
        matches!(self, TargetRule::Owner | TargetRule::All | TargetRule::Others)
    }
}

/// Where the authority re-publishes an authority-directed RPC after running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RelayMode {
    /// Run on the authority only.
    #[default]
    None,
    /// Re-publish to every connected peer, caller included.
    All,
    /// Re-publish to every connected peer except the caller.
    Others,
    /// Re-publish to the entity owner.
    Owner,
}

/// Immutable per-method RPC declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMetadata {
    /// Dispatch kind.
    pub kind: RpcKind,
    /// Targeting rule (meaningful for explicit-target RPCs).
    pub target_rule: TargetRule,
    /// Accessor name for [`TargetRule::PropertyDerived`].
    pub target_property: Option<String>,
    /// Whether the target accessor yields many peers.
    pub is_multi_target: bool,
    /// Reliable transport channel.
    pub is_reliable: bool,
    /// Declared as persistent (replayed to late joiners when the policy allows).
    pub is_persistent: bool,
    /// Caller wants a delivery report.
    pub expects_delivery_report: bool,
    /// Name of the registered validator, if any.
    pub validator: Option<String>,
    /// Only the entity owner may call (authority-directed RPCs).
    pub is_mine_required: bool,
    /// Authority-side relay after execution (authority-directed RPCs).
    pub relay: RelayMode,
}

impl RpcMetadata {
    fn base(kind: RpcKind, target_rule: TargetRule) -> Self {
        Self {
            kind,
            target_rule,
            target_property: None,
            is_multi_target: false,
            is_reliable: true,
            is_persistent: false,
            expects_delivery_report: false,
            validator: None,
            is_mine_required: false,
            relay: RelayMode::None,
        }
    }

    /// Authority-directed RPC; owner-only by default.
    pub fn authority_directed() -> Self {
        Self {
            is_mine_required: true,
            ..Self::base(RpcKind::AuthorityDirected, TargetRule::SingleAuthority)
        }
    }

    /// Broadcast RPC issued by the authority.
    pub fn broadcast() -> Self {
        Self::base(RpcKind::Broadcast, TargetRule::All)
    }

    /// Explicit-target RPC with a fixed rule.
    pub fn targeted(rule: TargetRule) -> Self {
        Self {
            is_multi_target: matches!(
                rule,
                TargetRule::All | TargetRule::Others | TargetRule::MultipleAuthorities
            ),
            ..Self::base(RpcKind::ExplicitTarget, rule)
        }
    }

    /// Explicit-target RPC whose targets come from a named accessor.
    pub fn property_targeted(property: impl Into<String>, is_multi_target: bool) -> Self {
        Self {
            target_property: Some(property.into()),
            is_multi_target,
            ..Self::base(RpcKind::ExplicitTarget, TargetRule::PropertyDerived)
        }
    }

    /// Send over the unreliable channel.
    pub fn unreliable(mut self) -> Self {
        self.is_reliable = false;
        self
    }

    /// Declare the RPC persistent.
    pub fn persistent(mut self) -> Self {
        self.is_persistent = true;
        self
    }

    /// Request a delivery report.
    pub fn with_delivery_report(mut self) -> Self {
        self.expects_delivery_report = true;
        self
    }

    /// Attach a validator by name.
    pub fn with_validator(mut self, name: impl Into<String>) -> Self {
        self.validator = Some(name.into());
        self
    }

    /// Allow non-owners to call.
    pub fn any_caller(mut self) -> Self {
        self.is_mine_required = false;
        self
    }

    /// Relay after authority execution.
    pub fn with_relay(mut self, relay: RelayMode) -> Self {
        self.relay = relay;
        self
    }
}

/// Registry row.
#[derive(Debug, Clone)]
pub struct RegisteredRpc {
    /// Wire id.
    pub id: RpcId,
    /// Entity type name.
    pub entity_type: String,
    /// Method name.
    pub method: String,
    /// Parameter count.
    pub arity: usize,
    /// Declaration.
    pub metadata: RpcMetadata,
}

impl RegisteredRpc {
    /// `Type.method` label for logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.entity_type, self.method)
    }
}

/// Lookup table from names and wire ids to metadata.
#[derive(Debug, Default)]
pub struct RpcRegistry {
    by_id: HashMap<RpcId, RegisteredRpc>,
    by_name: HashMap<(String, String), RpcId>,
}

impl RpcRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register metadata for `entity_type.method` taking `arity` parameters.
    ///
    /// Re-registering the same declaration is a no-op. A different
    /// declaration under the same name, or a different name hashing to an
    /// existing id, is rejected.
    pub fn register(
        &mut self,
        entity_type: &str,
        method: &str,
        arity: usize,
        metadata: RpcMetadata,
    ) -> Result<RpcId, RpcError> {
        let id = RpcId::of(entity_type, method);

        if let Some(existing) = self.by_id.get(&id) {
            if existing.entity_type != entity_type || existing.method != method {
                return Err(RpcError::RpcIdCollision {
                    rpc_id: id,
                    existing: existing.qualified_name(),
                    incoming: format!("{entity_type}.{method}"),
                });
            }
            if existing.metadata != metadata || existing.arity != arity {
                return Err(RpcError::AlreadyRegistered {
                    entity_type: entity_type.to_string(),
                    method: method.to_string(),
                });
            }
            return Ok(id);
        }

        debug!(rpc_id = %id, entity_type, method, arity, kind = ?metadata.kind, "Registered RPC");
        self.by_name
            .insert((entity_type.to_string(), method.to_string()), id);
        self.by_id.insert(
            id,
            RegisteredRpc {
                id,
                entity_type: entity_type.to_string(),
                method: method.to_string(),
                arity,
                metadata,
            },
        );
        Ok(id)
    }

    /// Look up by names.
    pub fn lookup(&self, entity_type: &str, method: &str) -> Option<&RegisteredRpc> {
        self.by_name
            .get(&(entity_type.to_string(), method.to_string()))
            .and_then(|id| self.by_id.get(id))
    }

    /// Look up by wire id.
    pub fn get(&self, id: RpcId) -> Option<&RegisteredRpc> {
        self.by_id.get(&id)
    }

    /// Every registration, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRpc> + '_ {
        self.by_id.values()
    }

    /// Number of registered RPCs.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Fingerprint of the registered RPC surface.
    ///
    /// Peers built with a different set of RPCs produce a different hash.
    pub fn schema_hash(&self) -> u64 {
        let ordered: BTreeMap<RpcId, &RegisteredRpc> =
            self.by_id.iter().map(|(id, rpc)| (*id, rpc)).collect();

        let mut hasher = blake3::Hasher::new();
        hasher.update(&PROTOCOL_VERSION.to_le_bytes());
        for (id, rpc) in ordered {
            hasher.update(&id.0.to_le_bytes());
            hasher.update(rpc.entity_type.as_bytes());
            hasher.update(b".");
            hasher.update(rpc.method.as_bytes());
            hasher.update(&(rpc.arity as u32).to_le_bytes());
            hasher.update(&[rpc.metadata.kind as u8, rpc.metadata.target_rule as u8]);
        }

        let hash = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[0..8]);
        u64::from_le_bytes(prefix)
    }
}
