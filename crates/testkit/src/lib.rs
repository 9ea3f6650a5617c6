#![warn(missing_docs)]
//! Deterministic multi-peer test harness for the RPC engine.

mod clock;
mod entity;
mod report;
mod session;

use anyhow::Result;
use meshrpc_core::{EntityId, PeerId, SimTick};
use meshrpc_rpc::SentMessage;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub use clock::*;
pub use entity::*;
pub use report::*;
pub use session::*;

/// One frame seen on the loopback network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    /// Tick the frame was collected on.
    pub tick: SimTick,
    /// Sender.
    pub from: PeerId,
    /// Receiver.
    pub to: PeerId,
    /// Message kind label.
    pub kind: &'static str,
    /// RPC wire id, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_id: Option<String>,
    /// Entity addressed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Reliable channel.
    pub reliable: bool,
    /// Frame size.
    pub bytes: usize,
}

impl TrafficRecord {
    /// Stamp a delivered frame with `tick`.
    pub fn from_sent(tick: SimTick, sent: SentMessage) -> Self {
        Self {
            tick,
            from: sent.from,
            to: sent.to,
            kind: sent.kind,
            rpc_id: sent.rpc_id.map(|id| id.to_string()),
            entity_id: sent.entity_id,
            reliable: sent.reliable,
            bytes: sent.bytes,
        }
    }
}

/// A sink that writes newline-delimited JSON to disk.
pub struct JsonlSink {
    file: File,
}

impl JsonlSink {
    /// Create a new sink at `path`, creating parent dirs if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self { file })
    }

    /// Append one record to the log.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }
}
