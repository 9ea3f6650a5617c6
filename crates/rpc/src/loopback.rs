//! In-process transport and entity directory.
//!
//! Every message is framed and parsed through the codec on its way between
//! peers, so a loopback session exercises the same bytes a socket would.

use crate::codec::encode_message;
use crate::engine::InboundSender;
use crate::host::{EntityDirectory, NetworkEntity, Transport};
use crate::metadata::RpcId;
use crate::protocol::RpcMessage;
use anyhow::{bail, Context, Result};
use meshrpc_core::{EntityId, PeerId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// One delivered frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    /// Sending peer.
    pub from: PeerId,
    /// Receiving peer.
    pub to: PeerId,
    /// Message kind label.
    pub kind: &'static str,
    /// RPC carried, for invoke and routed messages.
    pub rpc_id: Option<RpcId>,
    /// Entity addressed, for invoke and routed messages.
    pub entity_id: Option<EntityId>,
    /// Reliable channel.
    pub reliable: bool,
    /// Frame size.
    pub bytes: usize,
}

#[derive(Default)]
struct Hub {
    peers: BTreeMap<PeerId, InboundSender>,
    sent: Vec<SentMessage>,
}

/// Shared switchboard connecting loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route frames addressed to `peer` into `inbound`.
    pub fn attach(&self, peer: PeerId, inbound: InboundSender) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.peers.insert(peer, inbound);
        }
    }

    /// Stop routing to `peer`.
    pub fn detach(&self, peer: PeerId) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.peers.remove(&peer);
        }
    }

    /// Transport publishing as `local`.
    pub fn transport(&self, local: PeerId) -> LoopbackTransport {
        LoopbackTransport {
            local,
            network: self.clone(),
        }
    }

    /// Every frame delivered so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.hub.lock().map(|hub| hub.sent.clone()).unwrap_or_default()
    }

    /// Drain the delivery log.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        self.hub
            .lock()
            .map(|mut hub| std::mem::take(&mut hub.sent))
            .unwrap_or_default()
    }
}

/// [`Transport`] for one peer of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    local: PeerId,
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    fn publish(&self, target: Option<PeerId>, message: RpcMessage, reliable: bool) -> Result<()> {
        let frame = encode_message(&message).context("Failed to frame RPC message")?;
        let (rpc_id, entity_id) = match &message {
            RpcMessage::Invoke(envelope) => (Some(envelope.rpc_id), Some(envelope.entity_id)),
            RpcMessage::Routed(routed) => (
                Some(routed.envelope.rpc_id),
                Some(routed.envelope.entity_id),
            ),
            RpcMessage::Response(_) | RpcMessage::DeliveryReport(_) => (None, None),
        };

        let mut hub = match self.network.hub.lock() {
            Ok(hub) => hub,
            Err(_) => bail!("Loopback hub lock poisoned"),
        };

        let recipients: Vec<PeerId> = match target {
            Some(peer) => {
                if !hub.peers.contains_key(&peer) {
                    bail!("{peer} is not connected to the loopback network");
                }
                vec![peer]
            }
            None => hub.peers.keys().copied().filter(|p| *p != self.local).collect(),
        };

        for to in recipients {
            if let Some(inbound) = hub.peers.get(&to) {
                inbound
                    .deliver_frame(self.local, &frame)
                    .with_context(|| format!("Failed to deliver {} to {to}", message.kind()))?;
            }
            trace!(from = %self.local, %to, kind = message.kind(), bytes = frame.len(), "Loopback delivery");
            hub.sent.push(SentMessage {
                from: self.local,
                to,
                kind: message.kind(),
                rpc_id,
                entity_id,
                reliable,
                bytes: frame.len(),
            });
        }
        Ok(())
    }
}

/// In-memory [`EntityDirectory`] for one peer.
pub struct LocalDirectory {
    local: PeerId,
    authority: PeerId,
    entities: Mutex<HashMap<EntityId, Arc<dyn NetworkEntity>>>,
    connected: Mutex<BTreeSet<PeerId>>,
}

impl LocalDirectory {
    /// Directory for `local` in a session run by `authority`.
    pub fn new(local: PeerId, authority: PeerId) -> Self {
        Self {
            local,
            authority,
            entities: Mutex::new(HashMap::new()),
            connected: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make `entity` visible locally.
    pub fn spawn(&self, entity: Arc<dyn NetworkEntity>) {
        if let Ok(mut entities) = self.entities.lock() {
            entities.insert(entity.id(), entity);
        }
    }

    /// Remove an entity.
    pub fn despawn(&self, id: EntityId) -> Option<Arc<dyn NetworkEntity>> {
        self.entities.lock().ok()?.remove(&id)
    }

    /// Mark `peer` connected.
    pub fn connect(&self, peer: PeerId) {
        if let Ok(mut connected) = self.connected.lock() {
            connected.insert(peer);
        }
    }

    /// Mark `peer` disconnected.
    pub fn disconnect(&self, peer: PeerId) {
        if let Ok(mut connected) = self.connected.lock() {
            connected.remove(&peer);
        }
    }
}

impl EntityDirectory for LocalDirectory {
    fn lookup_entity(&self, id: EntityId) -> Option<Arc<dyn NetworkEntity>> {
        self.entities.lock().ok()?.get(&id).cloned()
    }

    fn is_authority(&self) -> bool {
        self.local == self.authority
    }

    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn authority_peer(&self) -> PeerId {
        self.authority
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected
            .lock()
            .map(|connected| connected.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::inbound_channel;
    use crate::protocol::RpcResponse;

    #[test]
    fn unicast_is_framed_and_logged() {
        let network = LoopbackNetwork::new();
        let (tx, mut rx) = inbound_channel();
        network.attach(PeerId(2), tx);

        let message = RpcMessage::Response(RpcResponse {
            correlation_id: 1,
            result: Ok(vec![1, 2, 3]),
        });
        network
            .transport(PeerId(1))
            .publish(Some(PeerId(2)), message.clone(), true)
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), (PeerId(1), message));
        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "response");
        assert_eq!(sent[0].to, PeerId(2));
    }

    #[test]
    fn multicast_skips_sender() {
        let network = LoopbackNetwork::new();
        let mut receivers = Vec::new();
        for peer in 1..=3 {
            let (tx, rx) = inbound_channel();
            network.attach(PeerId(peer), tx);
            receivers.push(rx);
        }

        let message = RpcMessage::Response(RpcResponse {
            correlation_id: 9,
            result: Err("x".into()),
        });
        network.transport(PeerId(1)).publish(None, message, false).unwrap();

        assert!(receivers[0].try_recv().is_err());
        assert!(receivers[1].try_recv().is_ok());
        assert!(receivers[2].try_recv().is_ok());
        assert_eq!(network.take_sent().len(), 2);
        assert!(network.sent().is_empty());
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let network = LoopbackNetwork::new();
        let message = RpcMessage::Response(RpcResponse {
            correlation_id: 1,
            result: Ok(vec![]),
        });
        assert!(network.transport(PeerId(1)).publish(Some(PeerId(5)), message, true).is_err());
    }

    #[test]
    fn directory_tracks_membership() {
        let directory = LocalDirectory::new(PeerId(1), PeerId(1));
        directory.connect(PeerId(3));
        directory.connect(PeerId(2));
        assert!(directory.is_authority());
        assert_eq!(directory.connected_peers(), vec![PeerId(2), PeerId(3)]);
        directory.disconnect(PeerId(3));
        assert_eq!(directory.connected_peers(), vec![PeerId(2)]);
    }
}
