//! Recording entity for session tests.

use meshrpc_core::{EntityId, PeerId};
use meshrpc_rpc::NetworkEntity;
use std::any::Any;
use std::sync::Mutex;

/// Entity that logs every handler call it receives.
///
/// `members` backs property-derived targeting in tests (a team roster, a
/// chat room).
#[derive(Debug)]
pub struct TestEntity {
    id: EntityId,
    type_name: String,
    owner: PeerId,
    calls: Mutex<Vec<String>>,
    members: Mutex<Vec<PeerId>>,
}

impl TestEntity {
    /// Entity of `type_name` owned by `owner`.
    pub fn new(id: EntityId, type_name: impl Into<String>, owner: PeerId) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            owner,
            calls: Mutex::new(Vec::new()),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Append to the call log.
    pub fn record(&self, call: impl Into<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.into());
        }
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Replace the member roster.
    pub fn set_members(&self, members: impl IntoIterator<Item = PeerId>) {
        if let Ok(mut roster) = self.members.lock() {
            *roster = members.into_iter().collect();
        }
    }

    /// Current member roster.
    pub fn members(&self) -> Vec<PeerId> {
        self.members.lock().map(|roster| roster.clone()).unwrap_or_default()
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
