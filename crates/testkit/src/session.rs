//! Multi-peer loopback session driven tick by tick.

use crate::clock::ManualClock;
use crate::entity::TestEntity;
use crate::TrafficRecord;
use anyhow::{anyhow, Result};
use meshrpc_core::{EntityId, PeerId, SimTick};
use meshrpc_rpc::{
    Clock, DiagnosticsSnapshot, EntityDirectory, LocalDirectory, LoopbackNetwork, RpcConfig,
    RpcEngine,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Peer id of the session authority.
pub const AUTHORITY: PeerId = PeerId(1);

type Installer = Box<dyn Fn(&mut RpcEngine) -> Result<()>>;

/// One participant.
pub struct SessionPeer {
    /// Peer id.
    pub id: PeerId,
    /// The peer's engine.
    pub engine: RpcEngine,
    /// The peer's view of entities and membership.
    pub directory: Arc<LocalDirectory>,
}

/// Authority plus clients wired through a [`LoopbackNetwork`].
///
/// Every peer registers the same RPC surface through the installer passed to
/// [`TestSession::new`]. [`TestSession::step`] advances the shared clock and
/// ticks the authority first, then every client in id order.
pub struct TestSession {
    network: LoopbackNetwork,
    clock: Arc<ManualClock>,
    config: RpcConfig,
    tick_duration: Duration,
    install: Installer,
    peers: BTreeMap<PeerId, SessionPeer>,
    traffic: Vec<TrafficRecord>,
}

impl TestSession {
    /// Session with the authority and `clients` clients (peers 2..).
    pub fn new<F>(config: RpcConfig, clients: u16, install: F) -> Result<Self>
    where
        F: Fn(&mut RpcEngine) -> Result<()> + 'static,
    {
        let mut session = Self {
            network: LoopbackNetwork::new(),
            clock: Arc::new(ManualClock::new()),
            config,
            tick_duration: Duration::from_millis(16),
            install: Box::new(install),
            peers: BTreeMap::new(),
            traffic: Vec::new(),
        };
        session.add_peer(AUTHORITY)?;
        for client in 0..clients {
            session.add_peer(PeerId(client + 2))?;
        }
        Ok(session)
    }

    /// Override the simulated duration of one tick.
    pub fn with_tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    /// Connect a new peer. Returns the number of persistent RPCs the
    /// authority replayed to it.
    pub fn add_peer(&mut self, peer: PeerId) -> Result<usize> {
        if self.peers.contains_key(&peer) {
            return Err(anyhow!("{peer} is already in the session"));
        }

        let directory = Arc::new(LocalDirectory::new(peer, AUTHORITY));
        let mut engine = RpcEngine::new(
            self.config.clone(),
            directory.clone(),
            Arc::new(self.network.transport(peer)),
            self.clock.clone(),
        );
        (self.install)(&mut engine)?;
        self.network.attach(peer, engine.inbound_sender());

        if peer != AUTHORITY {
            directory.connect(AUTHORITY);
        }
        self.peers.insert(
            peer,
            SessionPeer {
                id: peer,
                engine,
                directory,
            },
        );
        if peer == AUTHORITY {
            return Ok(0);
        }

        let authority = self.authority_mut()?;
        authority.directory.connect(peer);
        let replayed = authority.engine.on_peer_joined(peer);
        debug!(%peer, replayed, "Peer joined session");
        Ok(replayed)
    }

    /// Disconnect a client.
    pub fn remove_peer(&mut self, peer: PeerId) -> Option<SessionPeer> {
        self.network.detach(peer);
        if let Some(authority) = self.peers.get(&AUTHORITY) {
            authority.directory.disconnect(peer);
        }
        self.peers.remove(&peer)
    }

    /// Peer by id.
    pub fn peer(&self, peer: PeerId) -> Option<&SessionPeer> {
        self.peers.get(&peer)
    }

    /// Engine of `peer`.
    pub fn engine(&mut self, peer: PeerId) -> Result<&mut RpcEngine> {
        self.peers
            .get_mut(&peer)
            .map(|p| &mut p.engine)
            .ok_or_else(|| anyhow!("{peer} is not in the session"))
    }

    /// Engine of the authority.
    pub fn authority(&mut self) -> Result<&mut RpcEngine> {
        self.engine(AUTHORITY)
    }

    fn authority_mut(&mut self) -> Result<&mut SessionPeer> {
        self.peers
            .get_mut(&AUTHORITY)
            .ok_or_else(|| anyhow!("session has no authority"))
    }

    /// Peer ids in tick order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Spawn a fresh entity on one peer only.
    pub fn spawn_on(&self, peer: PeerId, id: EntityId, type_name: &str, owner: PeerId) -> Result<Arc<TestEntity>> {
        let target = self
            .peers
            .get(&peer)
            .ok_or_else(|| anyhow!("{peer} is not in the session"))?;
        let entity = Arc::new(TestEntity::new(id, type_name, owner));
        target.directory.spawn(entity.clone());
        Ok(entity)
    }

    /// Spawn a replica of the entity on every peer.
    pub fn spawn_everywhere(&self, id: EntityId, type_name: &str, owner: PeerId) -> BTreeMap<PeerId, Arc<TestEntity>> {
        self.peers
            .values()
            .map(|peer| {
                let entity = Arc::new(TestEntity::new(id, type_name, owner));
                peer.directory.spawn(entity.clone());
                (peer.id, entity)
            })
            .collect()
    }

    /// Destroy an entity on one peer. Returns the deferred RPCs cancelled.
    pub fn despawn_on(&mut self, peer: PeerId, id: EntityId) -> Result<usize> {
        let target = self
            .peers
            .get_mut(&peer)
            .ok_or_else(|| anyhow!("{peer} is not in the session"))?;
        target.directory.despawn(id);
        Ok(target.engine.on_entity_destroyed(id))
    }

    /// Advance the clock one tick and tick every engine.
    pub fn step(&mut self) -> SimTick {
        self.collect_traffic();
        let tick = self.clock.step(self.tick_duration);
        for peer in self.peers.values_mut() {
            peer.engine.tick();
        }
        self.collect_traffic();
        tick
    }

    /// Step `ticks` times.
    pub fn run(&mut self, ticks: u64) -> SimTick {
        let mut tick = self.clock.current_tick();
        for _ in 0..ticks {
            tick = self.step();
        }
        tick
    }

    /// Move time forward without ticking anyone.
    pub fn advance_time(&self, elapsed: Duration) {
        self.clock.advance_time(elapsed);
    }

    /// Shared clock.
    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    /// Every frame exchanged so far, stamped with the tick it was seen on.
    pub fn traffic(&mut self) -> &[TrafficRecord] {
        self.collect_traffic();
        &self.traffic
    }

    /// Diagnostics of every peer.
    pub fn diagnostics(&self) -> BTreeMap<PeerId, DiagnosticsSnapshot> {
        self.peers
            .iter()
            .map(|(id, peer)| (*id, peer.engine.diagnostics()))
            .collect()
    }

    fn collect_traffic(&mut self) {
        let tick = self.clock.current_tick();
        self.traffic.extend(
            self.network
                .take_sent()
                .into_iter()
                .map(|sent| TrafficRecord::from_sent(tick, sent)),
        );
    }
}

impl SessionPeer {
    /// Whether this peer is the authority.
    pub fn is_authority(&self) -> bool {
        self.directory.is_authority()
    }
}
