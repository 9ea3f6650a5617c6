//! Headless demo session.
//!
//! One authority and a handful of peers share a `Lobby` entity over the
//! loopback network. The script exercises every call shape: a persistent
//! broadcast, relayed authority calls, a validated team chat routed through
//! the authority, awaited score queries and a peer joining halfway through.

use crate::config::SessionConfig;
use anyhow::{Context, Result};
use meshrpc_core::{EntityId, PeerId, SimTick};
use meshrpc_rpc::{
    Clock, DiagnosticsSnapshot, HandlerOutcome, LocalDirectory, LoopbackNetwork, NetworkEntity,
    RelayMode, ResponseFuture, RpcConfig, RpcEngine, RpcError, RpcMetadata, TargetAccessor,
};
use meshrpc_testkit::{JsonlSink, TrafficRecord};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const AUTHORITY: PeerId = PeerId(1);
const LOBBY: EntityId = EntityId(1);
const LOBBY_TYPE: &str = "Lobby";

/// Shared room every peer replicates.
#[derive(Debug)]
pub struct Lobby {
    owner: PeerId,
    roster: Mutex<Vec<PeerId>>,
    ready: Mutex<BTreeSet<PeerId>>,
    log: Mutex<Vec<String>>,
}

impl Lobby {
    fn new(roster: Vec<PeerId>) -> Self {
        Self {
            owner: AUTHORITY,
            roster: Mutex::new(roster),
            ready: Mutex::new(BTreeSet::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    fn roster(&self) -> Vec<PeerId> {
        self.roster.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn mark_ready(&self, peer: PeerId) -> usize {
        match self.ready.lock() {
            Ok(mut ready) => {
                ready.insert(peer);
                ready.len()
            }
            Err(_) => 0,
        }
    }

    fn ready_count(&self) -> usize {
        self.ready.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn note(&self, line: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(line);
        }
    }

    fn log_len(&self) -> usize {
        self.log.lock().map(|l| l.len()).unwrap_or_default()
    }
}

impl NetworkEntity for Lobby {
    fn id(&self) -> EntityId {
        LOBBY
    }

    fn type_name(&self) -> &str {
        LOBBY_TYPE
    }

    fn owner(&self) -> PeerId {
        self.owner
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fixed-rate simulation clock.
struct TickClock {
    tick: AtomicU64,
    period: Duration,
}

impl TickClock {
    fn new(tick_rate_hz: u32) -> Self {
        Self {
            tick: AtomicU64::new(0),
            period: Duration::from_secs(1) / tick_rate_hz.max(1),
        }
    }

    fn advance(&self) -> SimTick {
        SimTick(self.tick.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Clock for TickClock {
    fn current_tick(&self) -> SimTick {
        SimTick(self.tick.load(Ordering::Relaxed))
    }

    fn current_time(&self) -> Duration {
        self.period * self.tick.load(Ordering::Relaxed) as u32
    }
}

fn install(engine: &mut RpcEngine) -> Result<(), RpcError> {
    let announce = engine.register_rpc::<(String,)>(
        LOBBY_TYPE,
        "announce",
        RpcMetadata::broadcast().persistent(),
    )?;
    engine.register_handler::<Lobby, (String,), (), _>(announce, |ctx, lobby, (text,)| {
        let origin = if ctx.is_replay { "replay" } else { "live" };
        lobby.note(format!("{}: announce ({origin}) {text}", ctx.local));
        Ok(HandlerOutcome::Ready(()))
    })?;

    let mark_ready = engine.register_rpc::<()>(
        LOBBY_TYPE,
        "mark_ready",
        RpcMetadata::authority_directed()
            .any_caller()
            .with_relay(RelayMode::Others),
    )?;
    engine.register_handler::<Lobby, (), usize, _>(mark_ready, |ctx, lobby, ()| {
        Ok(HandlerOutcome::Ready(lobby.mark_ready(ctx.source)))
    })?;

    engine.register_target_accessor(
        LOBBY_TYPE,
        "team_roster",
        TargetAccessor::multi::<Lobby, _>(|lobby, out| out.extend(lobby.roster())),
    );
    let team_chat = engine.register_rpc::<(String,)>(
        LOBBY_TYPE,
        "team_chat",
        RpcMetadata::property_targeted("team_roster", true).with_validator("clean_language"),
    )?;
    engine.register_validator::<(String,), _>(LOBBY_TYPE, "clean_language", |_ctx, (text,), result| {
        result.allow_all();
        if text.contains("darn") {
            *text = text.replace("darn", "****");
        }
    })?;
    engine.register_handler::<Lobby, (String,), (), _>(team_chat, |ctx, lobby, (text,)| {
        lobby.note(format!("{}: chat from {} {text}", ctx.local, ctx.source));
        Ok(HandlerOutcome::Ready(()))
    })?;

    let score = engine.register_rpc::<()>(
        LOBBY_TYPE,
        "score",
        RpcMetadata::authority_directed().any_caller(),
    )?;
    engine.register_handler::<Lobby, (), u32, _>(score, |_ctx, lobby, ()| {
        Ok(HandlerOutcome::Ready(lobby.ready_count() as u32))
    })?;
    Ok(())
}

struct Peer {
    id: PeerId,
    engine: RpcEngine,
    directory: Arc<LocalDirectory>,
    lobby: Arc<Lobby>,
}

/// Final state of a demo run.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub ticks: u64,
    pub peers: usize,
    pub messages: usize,
    pub bytes: usize,
    pub scores: Vec<(PeerId, u32)>,
    pub replayed: usize,
    pub schema_hash: String,
    pub lobby_events: Vec<(PeerId, usize)>,
    pub diagnostics: Vec<(PeerId, DiagnosticsSnapshot)>,
}

/// In-process session of one authority plus clients.
pub struct DemoSession {
    rpc: RpcConfig,
    network: LoopbackNetwork,
    clock: Arc<TickClock>,
    peers: Vec<Peer>,
    pending_scores: Vec<(PeerId, ResponseFuture<u32>)>,
    scores: Vec<(PeerId, u32)>,
    replayed: usize,
    messages: usize,
    bytes: usize,
    traffic: Option<JsonlSink>,
}

impl DemoSession {
    pub fn new(rpc: RpcConfig, session: &SessionConfig) -> Result<Self> {
        let traffic = match &session.traffic_log {
            Some(path) => Some(
                JsonlSink::create(path)
                    .with_context(|| format!("Failed to create traffic log {}", path.display()))?,
            ),
            None => None,
        };

        let mut demo = Self {
            rpc,
            network: LoopbackNetwork::new(),
            clock: Arc::new(TickClock::new(session.tick_rate_hz)),
            peers: Vec::new(),
            pending_scores: Vec::new(),
            scores: Vec::new(),
            replayed: 0,
            messages: 0,
            bytes: 0,
            traffic,
        };
        for index in 0..=session.peers {
            demo.join(PeerId(index + 1))?;
        }
        Ok(demo)
    }

    fn join(&mut self, peer: PeerId) -> Result<()> {
        let directory = Arc::new(LocalDirectory::new(peer, AUTHORITY));
        let mut engine = RpcEngine::new(
            self.rpc.clone(),
            directory.clone(),
            Arc::new(self.network.transport(peer)),
            self.clock.clone(),
        );
        install(&mut engine).with_context(|| format!("Failed to register RPCs on {peer}"))?;
        self.network.attach(peer, engine.inbound_sender());

        if peer != AUTHORITY {
            directory.connect(AUTHORITY);
        }
        let mut roster: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        roster.push(peer);
        let lobby = Arc::new(Lobby::new(roster.clone()));
        directory.spawn(lobby.clone());

        if let Some(authority) = self.peers.first() {
            if authority.engine.schema_hash() != engine.schema_hash() {
                warn!(%peer, "Peer registered a different RPC surface");
            }
        }
        self.peers.push(Peer {
            id: peer,
            engine,
            directory,
            lobby,
        });

        if peer != AUTHORITY {
            for existing in &self.peers {
                if let Ok(mut current) = existing.lobby.roster.lock() {
                    *current = roster.clone();
                }
            }
            if let Some(authority) = self.peers.first_mut() {
                authority.directory.connect(peer);
                self.replayed += authority.engine.on_peer_joined(peer);
            }
            debug!(%peer, "Peer joined");
        }
        Ok(())
    }

    /// Run `ticks` ticks of the scripted scenario.
    pub fn run(&mut self, ticks: u64) -> Result<SessionSummary> {
        let late_joiner_at = (ticks / 2).max(1);
        for _ in 0..ticks {
            let tick = self.clock.advance();
            self.script(tick, late_joiner_at)?;
            for peer in &mut self.peers {
                peer.engine.tick();
            }
            self.collect_scores();
            self.record_traffic(tick)?;
        }
        Ok(self.summary())
    }

    fn script(&mut self, tick: SimTick, late_joiner_at: u64) -> Result<()> {
        let clients = self.peers.len().saturating_sub(1) as u64;
        match tick.0 {
            1 => {
                self.peers[0]
                    .engine
                    .call_rpc(LOBBY, "announce", ("welcome to the lobby".to_string(),))?;
            }
            t if t >= 2 && t < 2 + clients => {
                let peer = &mut self.peers[(t - 1) as usize];
                peer.engine.call_rpc(LOBBY, "mark_ready", ())?;
            }
            _ => {}
        }

        if tick.0 == 2 + clients && self.peers.len() > 1 {
            let summary = self.peers[1]
                .engine
                .call_rpc(LOBBY, "team_chat", ("darn good game".to_string(),))?;
            debug!(?summary, "Team chat sent");
        }
        if tick.0 == 4 + clients {
            for peer in self.peers.iter_mut().skip(1) {
                let response = peer.engine.call_rpc_async::<(), u32>(LOBBY, "score", ())?;
                self.pending_scores.push((peer.id, response));
            }
        }
        if tick.0 == late_joiner_at {
            let next = PeerId(self.peers.len() as u16 + 1);
            self.join(next)?;
            info!(peer = %next, replayed = self.replayed, "Late joiner connected");
        }
        Ok(())
    }

    fn collect_scores(&mut self) {
        let mut still_pending = Vec::with_capacity(self.pending_scores.len());
        for (peer, mut response) in self.pending_scores.drain(..) {
            match response.try_take() {
                Some(Ok(score)) => self.scores.push((peer, score)),
                Some(Err(err)) => warn!(%peer, "Score query failed: {err}"),
                None => still_pending.push((peer, response)),
            }
        }
        self.pending_scores = still_pending;
    }

    fn record_traffic(&mut self, tick: SimTick) -> Result<()> {
        for sent in self.network.take_sent() {
            self.messages += 1;
            self.bytes += sent.bytes;
            if let Some(traffic) = self.traffic.as_mut() {
                traffic.write(&TrafficRecord::from_sent(tick, sent))?;
            }
        }
        Ok(())
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            ticks: self.clock.current_tick().0,
            peers: self.peers.len(),
            messages: self.messages,
            bytes: self.bytes,
            scores: self.scores.clone(),
            replayed: self.replayed,
            schema_hash: self
                .peers
                .first()
                .map(|p| format!("{:016x}", p.engine.schema_hash()))
                .unwrap_or_default(),
            lobby_events: self.peers.iter().map(|p| (p.id, p.lobby.log_len())).collect(),
            diagnostics: self
                .peers
                .iter()
                .map(|p| (p.id, p.engine.diagnostics()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_runs_every_call_shape() {
        let config = SessionConfig {
            peers: 2,
            ticks: 20,
            ..SessionConfig::default()
        };
        let mut demo = DemoSession::new(RpcConfig::default(), &config).unwrap();
        let summary = demo.run(config.ticks).unwrap();

        assert_eq!(summary.ticks, 20);
        assert_eq!(summary.peers, 4);
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.scores.len(), 2);
        assert!(summary.scores.iter().all(|(_, score)| *score == 2));
        assert!(summary.messages > 0);
        assert!(summary
            .diagnostics
            .iter()
            .all(|(_, d)| d.handler_failures == 0 && d.invalid_targets == 0));
        // The authority saw the announcement and the filtered chat.
        assert!(demo.peers[0].lobby.log.lock().unwrap().iter().any(|l| l.contains("**** good game")));
    }

    #[test]
    fn traffic_log_has_one_line_per_message() {
        let path = std::env::temp_dir().join(format!("meshrpc-traffic-{}.jsonl", std::process::id()));
        let config = SessionConfig {
            peers: 1,
            ticks: 10,
            traffic_log: Some(path.clone()),
            ..SessionConfig::default()
        };
        let summary = DemoSession::new(RpcConfig::default(), &config)
            .unwrap()
            .run(config.ticks)
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), summary.messages);
        assert!(lines.iter().all(|line| line.get("tick").is_some() && line.get("bytes").is_some()));
        std::fs::remove_file(&path).ok();
    }
}
