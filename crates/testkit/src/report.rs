//! Session reports for CI artifacts.
//!
//! A report summarises one scenario run: how many ticks it took, how much
//! traffic crossed the loopback network and what every peer's diagnostics
//! counters ended at. Reports are written as pretty JSON.

use crate::session::TestSession;
use anyhow::Result;
use meshrpc_core::PeerId;
use meshrpc_rpc::{Clock, DiagnosticsSnapshot};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Overall scenario outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    /// Every assertion held
    Pass,
    /// At least one assertion failed
    Fail,
}

/// Traffic totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSummary {
    /// Frames delivered
    pub messages: usize,
    /// Frame bytes delivered
    pub bytes: usize,
    /// Frames on the reliable channel
    pub reliable: usize,
}

/// Final counters of one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerDiagnostics {
    /// Peer id
    pub peer: PeerId,
    /// Counter snapshot
    pub diagnostics: DiagnosticsSnapshot,
}

/// Report of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Scenario identifier
    pub test_name: String,
    /// Collection time (RFC 3339)
    pub timestamp: String,
    /// Outcome
    pub result: TestResult,
    /// Final simulation tick
    pub ticks: u64,
    /// Traffic totals
    pub traffic: TrafficSummary,
    /// Per-peer diagnostics
    pub peers: Vec<PeerDiagnostics>,
}

impl SessionReport {
    /// Capture the current state of `session`.
    pub fn capture(test_name: impl Into<String>, session: &mut TestSession, result: TestResult) -> Self {
        let ticks = session.clock().current_tick().0;
        let traffic = session.traffic().iter().fold(TrafficSummary::default(), |mut sum, record| {
            sum.messages += 1;
            sum.bytes += record.bytes;
            sum.reliable += usize::from(record.reliable);
            sum
        });
        let peers = session
            .diagnostics()
            .into_iter()
            .map(|(peer, diagnostics)| PeerDiagnostics { peer, diagnostics })
            .collect();

        Self {
            test_name: test_name.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            result,
            ticks,
            traffic,
            peers,
        }
    }
}

/// Writes session reports to disk.
pub struct ReportSink {
    path: PathBuf,
}

impl ReportSink {
    /// Sink at `path`, creating parent directories if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Write `report` as pretty JSON.
    pub fn write(&self, report: &SessionReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
