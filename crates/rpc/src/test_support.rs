//! Fixtures shared by unit tests.

use crate::host::{Clock, EntityDirectory, NetworkEntity};
use meshrpc_core::{EntityId, PeerId, SimTick};
use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimal entity recording the calls its handlers see.
#[derive(Debug)]
pub struct TestEntity {
    id: EntityId,
    type_name: String,
    owner: PeerId,
    pub calls: Mutex<Vec<String>>,
}

impl TestEntity {
    pub fn new(id: EntityId, type_name: &str, owner: PeerId) -> Self {
        Self {
            id,
            type_name: type_name.to_string(),
            owner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl NetworkEntity for TestEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn owner(&self) -> PeerId {
        self.owner
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Directory with a fixed role and peer list and no entities.
pub struct FixedDirectory {
    local: PeerId,
    authority: PeerId,
    connected: Vec<PeerId>,
}

impl FixedDirectory {
    pub fn authority(local: PeerId, connected: Vec<PeerId>) -> Self {
        Self {
            local,
            authority: local,
            connected,
        }
    }

    pub fn client(local: PeerId, authority: PeerId) -> Self {
        Self {
            local,
            authority,
            connected: vec![authority],
        }
    }
}

impl EntityDirectory for FixedDirectory {
    fn lookup_entity(&self, _id: EntityId) -> Option<Arc<dyn NetworkEntity>> {
        None
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
        self.connected.clone()
    }
}

/// Clock advanced by hand.
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<(SimTick, Duration)>,
}

impl ManualClock {
    /// Move one tick forward and `elapsed` further in time.
    pub fn advance(&self, elapsed: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 = state.0.advance(1);
        state.1 += elapsed;
    }
}

impl Clock for ManualClock {
    fn current_tick(&self) -> SimTick {
        self.state.lock().unwrap().0
    }

    fn current_time(&self) -> Duration {
        self.state.lock().unwrap().1
    }
}
