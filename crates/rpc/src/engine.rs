//! Dispatch and routing.
//!
//! The engine runs on the simulation thread. Inbound messages are queued by
//! an [`InboundSender`] from any thread and only touch engine state once
//! [`RpcEngine::tick`] (or [`RpcEngine::drain_inbound`]) pulls them in.

use crate::args::RpcArgs;
use crate::codec::{decode_message, encode_args};
use crate::config::RpcConfig;
use crate::context::{RpcContext, ValidationContext};
use crate::correlation::{CorrelationId, CorrelationTracker, DeliveryReportFuture, ResponseFuture};
use crate::deferred::{DeferredPassReport, DeferredQueue, DeferredRpcEntry};
use crate::diagnostics::{DiagnosticsSnapshot, RpcDiagnostics};
use crate::error::RpcError;
use crate::handlers::{HandlerResult, HandlerTable, Invocation};
use crate::host::{Clock, EntityDirectory, NetworkEntity, Transport};
use crate::metadata::{RegisteredRpc, RelayMode, RpcId, RpcKind, RpcMetadata, RpcRegistry, TargetRule};
use crate::persistence::{PersistentRpcRecord, PersistentRpcStore};
use crate::protocol::{
    DeliveryReport, DeliveryReportMessage, RoutedRpcEnvelope, RpcEnvelope, RpcMessage, RpcResponse,
};
use crate::targets::{TargetAccessor, TargetResolver, TargetSet};
use crate::validation::{ValidationEngine, ValidationResult};
use meshrpc_core::{EntityId, PeerId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

type Inbound = (PeerId, RpcMessage);

/// Thread-safe handle feeding received messages to an engine.
#[derive(Clone, Debug)]
pub struct InboundSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl InboundSender {
    /// Queue a decoded message from `source`.
    pub fn deliver(&self, source: PeerId, message: RpcMessage) -> Result<(), RpcError> {
        self.tx
            .send((source, message))
            .map_err(|_| RpcError::Transport("engine inbound queue is closed".into()))
    }

    /// Decode and queue a framed message from `source`.
    pub fn deliver_frame(&self, source: PeerId, frame: &[u8]) -> Result<(), RpcError> {
        let message = decode_message(frame)?;
        self.deliver(source, message)
    }
}

pub(crate) fn inbound_channel() -> (InboundSender, mpsc::UnboundedReceiver<Inbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (InboundSender { tx }, rx)
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Read-only validation scenario; identical keys share a cached result.
    pub scenario_key: Option<String>,
}

impl CallOptions {
    /// Options with a validation scenario key.
    pub fn scenario(key: impl Into<String>) -> Self {
        Self {
            scenario_key: Some(key.into()),
        }
    }
}

/// What a synchronous call did on this peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSummary {
    /// The handler ran locally.
    pub executed_locally: bool,
    /// Local execution was deferred.
    pub deferred_locally: bool,
    /// Remote peers the call was sent to.
    pub sent_to: Vec<PeerId>,
    /// Targets denied by validation.
    pub denied: Vec<PeerId>,
    /// Forwarded to the authority for routing.
    pub forwarded: bool,
    /// Refused without effect.
    pub rejected: bool,
    /// Delivery report, when this peer is the authority routing the call.
    pub report: Option<DeliveryReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Executed,
    Deferred,
    Failed,
    Rejected,
}

struct RouteOutcome {
    report: DeliveryReport,
    local: Option<Delivery>,
}

/// RPC engine for one peer.
pub struct RpcEngine {
    config: RpcConfig,
    registry: RpcRegistry,
    resolver: TargetResolver,
    validation: ValidationEngine,
    handlers: HandlerTable,
    deferred: DeferredQueue,
    correlation: CorrelationTracker,
    persistent: PersistentRpcStore,
    diagnostics: Arc<RpcDiagnostics>,
    directory: Arc<dyn EntityDirectory>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    inbound_tx: InboundSender,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
}

impl RpcEngine {
    /// Engine for the peer described by `directory`.
    pub fn new(
        config: RpcConfig,
        directory: Arc<dyn EntityDirectory>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let diagnostics = Arc::new(RpcDiagnostics::default());
        let (inbound_tx, inbound_rx) = inbound_channel();
        Self {
            registry: RpcRegistry::new(),
            resolver: TargetResolver::new(),
            validation: ValidationEngine::new(
                config.validation_cache_ttl(),
                config.validation_pool_size,
                Arc::clone(&diagnostics),
            ),
            handlers: HandlerTable::default(),
            deferred: DeferredQueue::from_config(&config),
            correlation: CorrelationTracker::new(Arc::clone(&diagnostics)),
            persistent: PersistentRpcStore::new(),
            diagnostics,
            directory,
            transport,
            clock,
            inbound_tx,
            inbound_rx,
            config,
        }
    }

    // Registration

    /// Declare `entity_type.method` taking `A`.
    pub fn register_rpc<A: RpcArgs>(
        &mut self,
        entity_type: &str,
        method: &str,
        metadata: RpcMetadata,
    ) -> Result<RpcId, RpcError> {
        let id = RpcId::of(entity_type, method);
        if let Some(name) = metadata.validator.as_deref() {
            if let Some(arity) = self.validation.validator_arity(entity_type, name) {
                if arity != A::ARITY {
                    return Err(RpcError::ArityMismatch {
                        rpc_id: id,
                        expected: A::ARITY,
                        actual: arity,
                    });
                }
            }
        }
        self.registry.register(entity_type, method, A::ARITY, metadata)
    }

    /// Install the handler of a registered RPC.
    pub fn register_handler<E, A, R, F>(&mut self, rpc_id: RpcId, handler: F) -> Result<(), RpcError>
    where
        E: NetworkEntity,
        A: RpcArgs,
        R: Serialize + 'static,
        F: Fn(&RpcContext, &E, A) -> HandlerResult<R> + Send + Sync + 'static,
    {
        let rpc = self
            .registry
            .get(rpc_id)
            .ok_or(RpcError::UnknownRpcId { rpc_id })?;
        self.handlers.register(rpc, handler)
    }

    /// Register validator `name` for RPCs of `entity_type`.
    pub fn register_validator<A, F>(&self, entity_type: &str, name: &str, validator: F) -> Result<(), RpcError>
    where
        A: RpcArgs,
        F: Fn(&ValidationContext<'_>, &mut A, &mut ValidationResult) + Send + Sync + 'static,
    {
        let users = self.registry.iter().filter(|rpc| {
            rpc.entity_type == entity_type && rpc.metadata.validator.as_deref() == Some(name)
        });
        for rpc in users {
            if rpc.arity != A::ARITY {
                return Err(RpcError::ArityMismatch {
                    rpc_id: rpc.id,
                    expected: rpc.arity,
                    actual: A::ARITY,
                });
            }
        }
        self.validation.register(entity_type, name, validator);
        Ok(())
    }

    /// Register the accessor behind a property-derived target rule.
    pub fn register_target_accessor(&mut self, entity_type: &str, property: &str, accessor: TargetAccessor) {
        self.resolver.register_accessor(entity_type, property, accessor);
    }

    /// Wire id of `entity_type.method`, if registered.
    pub fn rpc_id(&self, entity_type: &str, method: &str) -> Option<RpcId> {
        self.registry.lookup(entity_type, method).map(|rpc| rpc.id)
    }

    /// Fingerprint of the registered RPC surface.
    pub fn schema_hash(&self) -> u64 {
        self.registry.schema_hash()
    }

    // Calls

    /// Invoke `method` on `entity_id`.
    pub fn call_rpc<A: RpcArgs>(&mut self, entity_id: EntityId, method: &str, args: A) -> Result<CallSummary, RpcError> {
        self.call_rpc_with(entity_id, method, args, CallOptions::default())
    }

    /// Invoke `method` on `entity_id` with call options.
    #[instrument(skip(self, args, options))]
    pub fn call_rpc_with<A: RpcArgs>(
        &mut self,
        entity_id: EntityId,
        method: &str,
        args: A,
        options: CallOptions,
    ) -> Result<CallSummary, RpcError> {
        let (entity, rpc, payload) = self.prepare(entity_id, method, &args)?;
        let envelope = self.envelope(&rpc, entity_id, payload, None);

        match rpc.metadata.kind {
            RpcKind::AuthorityDirected => self.call_authority(&rpc, entity.as_ref(), envelope),
            RpcKind::Broadcast => Ok(self.call_broadcast(&rpc, entity.as_ref(), envelope)),
            RpcKind::ExplicitTarget => {
                let targets = self.resolve_targets(entity.as_ref(), &rpc, args.first_arg())?;
                self.call_targeted(&rpc, entity.as_ref(), envelope, targets, None, options.scenario_key)
            }
        }
    }

    /// Invoke an authority-directed RPC and await its return value.
    pub fn call_rpc_async<A, R>(&mut self, entity_id: EntityId, method: &str, args: A) -> Result<ResponseFuture<R>, RpcError>
    where
        A: RpcArgs,
        R: DeserializeOwned,
    {
        let (entity, rpc, payload) = self.prepare(entity_id, method, &args)?;
        if rpc.metadata.kind != RpcKind::AuthorityDirected {
            return Err(RpcError::UnsupportedOperation {
                method: rpc.qualified_name(),
                operation: "call_rpc_async",
            });
        }

        let local = self.directory.local_peer();
        let is_authority = self.directory.is_authority();
        if !is_authority {
            self.check_owner(&rpc, entity.as_ref(), local)?;
        }

        let id = self.correlation.next_id();
        let future = self.correlation.register_response::<R>(
            id,
            self.clock.current_time(),
            self.config.response_timeout(),
        );
        let envelope = self.envelope(&rpc, entity_id, payload, Some(id.0));

        if is_authority {
            // Local execution resolves the correlation directly.
            self.attempt(self.entry(envelope, local, rpc.metadata.is_reliable), true);
            return Ok(future);
        }

        let authority = self.directory.authority_peer();
        if let Err(err) = self.publish(Some(authority), RpcMessage::Invoke(envelope), rpc.metadata.is_reliable) {
            self.correlation.fail(id, err.clone());
            return Err(err);
        }
        Ok(future)
    }

    /// Invoke an explicit-target RPC and await its delivery report.
    pub fn call_rpc_with_report<A: RpcArgs>(
        &mut self,
        entity_id: EntityId,
        method: &str,
        args: A,
    ) -> Result<DeliveryReportFuture, RpcError> {
        let (entity, rpc, payload) = self.prepare(entity_id, method, &args)?;
        if rpc.metadata.kind != RpcKind::ExplicitTarget || !rpc.metadata.expects_delivery_report {
            return Err(RpcError::UnsupportedOperation {
                method: rpc.qualified_name(),
                operation: "call_rpc_with_report",
            });
        }

        let targets = self.resolve_targets(entity.as_ref(), &rpc, args.first_arg())?;
        let envelope = self.envelope(&rpc, entity_id, payload, None);

        if self.directory.is_authority() {
            let outcome = self.route_targeted(&rpc, entity.as_ref(), envelope, &targets, false, None);
            return Ok(DeliveryReportFuture::ready(Ok(outcome.report)));
        }

        let id = self.correlation.next_id();
        let future = self.correlation.register_report(
            id,
            self.clock.current_time(),
            self.config.delivery_report_timeout(),
        );
        if let Err(err) = self.call_targeted(&rpc, entity.as_ref(), envelope, targets, Some(id), None) {
            self.correlation.fail(id, err.clone());
            return Err(err);
        }
        Ok(future)
    }

    /// Park an envelope until its entity or handler appears.
    pub fn defer_rpc(&mut self, source: PeerId, envelope: RpcEnvelope) {
        let reliable = self.is_reliable(envelope.rpc_id);
        let err = RpcError::HandlerNotRegistered {
            rpc_id: envelope.rpc_id,
        };
        let entry = self.entry(envelope, source, reliable);
        self.park(entry, true, &err);
    }

    // Per-tick driving

    /// Drain inbound messages, expire correlations and run a retry pass.
    #[instrument(skip(self), fields(tick = self.clock.current_tick().0))]
    pub fn tick(&mut self) -> DeferredPassReport {
        let received = self.drain_inbound();
        let expired = self.expire_correlations();
        if received > 0 || expired > 0 {
            debug!(received, expired, "Processed inbound RPC traffic");
        }
        self.process_deferred_retries()
    }

    /// Handle every queued inbound message.
    pub fn drain_inbound(&mut self) -> usize {
        let mut received = 0;
        while let Ok((source, message)) = self.inbound_rx.try_recv() {
            self.receive(source, message);
            received += 1;
        }
        received
    }

    /// Time out overdue correlations.
    pub fn expire_correlations(&self) -> usize {
        self.correlation.expire(self.clock.current_time())
    }

    /// One deferred retry pass; at most one attempt per entry per tick.
    pub fn process_deferred_retries(&mut self) -> DeferredPassReport {
        let tick = self.clock.current_tick();
        let now = self.clock.current_time();
        let directory = Arc::clone(&self.directory);
        let (ready, report) = self
            .deferred
            .drain_due(tick, now, |id| directory.lookup_entity(id).is_some());

        for err in &report.timed_out {
            warn!("{err}; dropping");
        }
        for err in &report.exhausted {
            warn!("{err}; dropping");
        }
        RpcDiagnostics::add(&self.diagnostics.deferred_timed_out, report.timed_out.len() as u64);
        RpcDiagnostics::add(
            &self.diagnostics.deferred_retry_exhausted,
            report.exhausted.len() as u64,
        );

        for entry in ready {
            if self.attempt(entry, false) == Delivery::Executed {
                RpcDiagnostics::bump(&self.diagnostics.deferred_delivered);
            }
        }
        report
    }

    /// Handle one message received from `source`.
    pub fn receive(&mut self, source: PeerId, message: RpcMessage) {
        let is_authority = self.directory.is_authority();
        match message {
            RpcMessage::Invoke(mut envelope) => {
                // The authority trusts the transport, not the envelope.
                if is_authority {
                    envelope.originator = source;
                }
                let reliable = self.is_reliable(envelope.rpc_id);
                let entry = self.entry(envelope, source, reliable);
                self.attempt(entry, true);
            }
            RpcMessage::Routed(mut routed) => {
                if !is_authority {
                    warn!(%source, "Ignoring routed RPC received by a non-authority");
                    return;
                }
                routed.envelope.originator = source;
                self.handle_routed(routed);
            }
            RpcMessage::Response(RpcResponse {
                correlation_id,
                result,
            }) => {
                self.correlation
                    .resolve_response(CorrelationId(correlation_id), result.map_err(RpcError::Remote));
            }
            RpcMessage::DeliveryReport(DeliveryReportMessage {
                correlation_id,
                report,
            }) => {
                self.correlation
                    .resolve_report(CorrelationId(correlation_id), report.map_err(RpcError::Remote));
            }
        }
    }

    /// Handle for queuing inbound messages from another thread.
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound_tx.clone()
    }

    // Lifecycle

    /// Drop everything pending for a destroyed entity. Returns the number of
    /// deferred RPCs cancelled.
    pub fn on_entity_destroyed(&mut self, entity_id: EntityId) -> usize {
        let cancelled = self.deferred.cancel_entity(entity_id);
        let dropped = self.persistent.remove_entity(entity_id);
        RpcDiagnostics::add(&self.diagnostics.deferred_cancelled, cancelled as u64);
        if cancelled > 0 || dropped > 0 {
            debug!(entity = %entity_id, cancelled, dropped, "Entity destroyed");
        }
        cancelled
    }

    /// Replay persistent RPCs to a peer that just connected. Returns the
    /// number of records sent.
    pub fn on_peer_joined(&mut self, peer: PeerId) -> usize {
        if !self.directory.is_authority() {
            return 0;
        }

        let records: Vec<PersistentRpcRecord> = self.persistent.records().cloned().collect();
        let mut replayed = 0;
        for record in records {
            if !self.replay_applies(&record, peer) {
                continue;
            }
            match self.publish(Some(peer), RpcMessage::Invoke(record.envelope), record.reliable) {
                Ok(()) => replayed += 1,
                Err(err) => warn!(%peer, "Failed to replay persistent RPC: {err}"),
            }
        }

        RpcDiagnostics::add(&self.diagnostics.persistent_replayed, replayed as u64);
        if replayed > 0 {
            info!(%peer, replayed, "Replayed persistent RPCs to late joiner");
        }
        replayed
    }

    // Introspection

    /// Counter snapshot.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Deferred RPCs waiting.
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Whether any deferred RPC waits for `entity_id`.
    pub fn has_deferred_for(&self, entity_id: EntityId) -> bool {
        self.deferred.contains_entity(entity_id)
    }

    /// Asynchronous calls awaiting resolution.
    pub fn pending_correlations(&self) -> usize {
        self.correlation.pending_count()
    }

    /// Persistent records retained for late joiners.
    pub fn persistent_records(&self) -> usize {
        self.persistent.len()
    }

    /// Active configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    // Internals

    fn prepare<A: RpcArgs>(
        &self,
        entity_id: EntityId,
        method: &str,
        args: &A,
    ) -> Result<(Arc<dyn NetworkEntity>, RegisteredRpc, Vec<u8>), RpcError> {
        let entity = self
            .directory
            .lookup_entity(entity_id)
            .ok_or(RpcError::EntityNotFound { entity_id })?;
        let rpc = self
            .registry
            .lookup(entity.type_name(), method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownRpc {
                entity_type: entity.type_name().to_string(),
                method: method.to_string(),
            })?;
        if rpc.arity != A::ARITY {
            return Err(RpcError::ArityMismatch {
                rpc_id: rpc.id,
                expected: rpc.arity,
                actual: A::ARITY,
            });
        }
        let payload = encode_args(args)?;
        Ok((entity, rpc, payload))
    }

    fn envelope(&self, rpc: &RegisteredRpc, entity_id: EntityId, payload: Vec<u8>, correlation_id: Option<u64>) -> RpcEnvelope {
        RpcEnvelope {
            rpc_id: rpc.id,
            entity_id,
            payload,
            correlation_id,
            originator: self.directory.local_peer(),
            tick: self.clock.current_tick(),
            replayed: false,
        }
    }

    fn entry(&self, envelope: RpcEnvelope, source: PeerId, reliable: bool) -> DeferredRpcEntry {
        DeferredRpcEntry::new(
            envelope,
            source,
            self.directory.local_peer(),
            reliable,
            self.clock.current_time(),
        )
    }

    fn is_reliable(&self, rpc_id: RpcId) -> bool {
        self.registry
            .get(rpc_id)
            .map_or(true, |rpc| rpc.metadata.is_reliable)
    }

    fn publish(&self, target: Option<PeerId>, message: RpcMessage, reliable: bool) -> Result<(), RpcError> {
        self.transport
            .publish(target, message, reliable)
            .map_err(|err| RpcError::Transport(format!("{err:#}")))
    }

    fn check_owner(&self, rpc: &RegisteredRpc, entity: &dyn NetworkEntity, caller: PeerId) -> Result<(), RpcError> {
        if rpc.metadata.is_mine_required && entity.owner() != caller {
            RpcDiagnostics::bump(&self.diagnostics.not_owner_rejections);
            let err = RpcError::NotOwner {
                peer: caller,
                entity_id: entity.id(),
            };
            warn!(rpc = %rpc.qualified_name(), "{err}");
            return Err(err);
        }
        Ok(())
    }

    fn resolve_targets(
        &self,
        entity: &dyn NetworkEntity,
        rpc: &RegisteredRpc,
        first_arg: Option<&dyn Any>,
    ) -> Result<TargetSet, RpcError> {
        match self
            .resolver
            .resolve(entity, rpc, first_arg, self.directory.as_ref())
        {
            Ok(targets) => {
                RpcDiagnostics::add(&self.diagnostics.targets_truncated, targets.truncated() as u64);
                Ok(targets)
            }
            Err(err) => {
                error!("{err}; call aborted");
                RpcDiagnostics::bump(&self.diagnostics.invalid_targets);
                Err(err)
            }
        }
    }

    fn call_authority(
        &mut self,
        rpc: &RegisteredRpc,
        entity: &dyn NetworkEntity,
        envelope: RpcEnvelope,
    ) -> Result<CallSummary, RpcError> {
        let local = self.directory.local_peer();
        let mut summary = CallSummary::default();

        if self.directory.is_authority() {
            let delivery = self.attempt(self.entry(envelope, local, rpc.metadata.is_reliable), true);
            summary.executed_locally = delivery == Delivery::Executed;
            summary.deferred_locally = delivery == Delivery::Deferred;
            summary.rejected = delivery == Delivery::Rejected;
            return Ok(summary);
        }

        self.check_owner(rpc, entity, local)?;
        let authority = self.directory.authority_peer();
        self.publish(Some(authority), RpcMessage::Invoke(envelope), rpc.metadata.is_reliable)?;
        summary.sent_to.push(authority);
        Ok(summary)
    }

    fn call_broadcast(&mut self, rpc: &RegisteredRpc, entity: &dyn NetworkEntity, envelope: RpcEnvelope) -> CallSummary {
        let mut summary = CallSummary::default();
        if !self.directory.is_authority() {
            RpcDiagnostics::bump(&self.diagnostics.broadcast_rejections);
            warn!(rpc = %rpc.qualified_name(), "Only the authority may broadcast; call ignored");
            summary.rejected = true;
            return summary;
        }

        let local = self.directory.local_peer();
        let reliable = rpc.metadata.is_reliable;
        let delivery = self.attempt(self.entry(envelope.clone(), local, reliable), true);
        summary.executed_locally = delivery == Delivery::Executed;
        summary.deferred_locally = delivery == Delivery::Deferred;

        let remote = TargetSet::from_peers(self.directory.connected_peers());
        if remote.truncated() > 0 {
            warn!(rpc = %rpc.qualified_name(), dropped = remote.truncated(), "Broadcast exceeds MAX_TARGETS; extra peers dropped");
            RpcDiagnostics::add(&self.diagnostics.targets_truncated, remote.truncated() as u64);
        }

        if self.persistent.record(&rpc.metadata, &envelope, entity.owner()) {
            RpcDiagnostics::bump(&self.diagnostics.persistent_recorded);
            match self.publish(None, RpcMessage::Invoke(envelope), reliable) {
                Ok(()) => summary.sent_to = remote.as_slice().to_vec(),
                Err(err) => warn!(rpc = %rpc.qualified_name(), "Broadcast publish failed: {err}"),
            }
            return summary;
        }

        for peer in remote.iter() {
            match self.publish(Some(peer), RpcMessage::Invoke(envelope.clone()), reliable) {
                Ok(()) => summary.sent_to.push(peer),
                Err(err) => warn!(rpc = %rpc.qualified_name(), %peer, "Broadcast publish failed: {err}"),
            }
        }
        summary
    }

    fn call_targeted(
        &mut self,
        rpc: &RegisteredRpc,
        entity: &dyn NetworkEntity,
        envelope: RpcEnvelope,
        targets: TargetSet,
        report_correlation: Option<CorrelationId>,
        scenario_key: Option<String>,
    ) -> Result<CallSummary, RpcError> {
        let local = self.directory.local_peer();
        let reliable = rpc.metadata.is_reliable;
        let mut summary = CallSummary::default();

        if self.directory.is_authority() {
            let outcome = self.route_targeted(rpc, entity, envelope, &targets, false, scenario_key.as_deref());
            summary.executed_locally = outcome.local == Some(Delivery::Executed);
            summary.deferred_locally = outcome.local == Some(Delivery::Deferred);
            summary.sent_to = outcome
                .report
                .delivered_to
                .iter()
                .copied()
                .filter(|peer| *peer != local)
                .collect();
            summary.denied = outcome.report.failed_delivery.clone();
            summary.report = Some(outcome.report);
            return Ok(summary);
        }

        // Optimistic local execution; the authority decides for everyone else.
        let executed_by_originator = targets.contains(local);
        if executed_by_originator {
            let delivery = self.attempt(self.entry(envelope.clone(), local, reliable), true);
            summary.executed_locally = delivery == Delivery::Executed;
            summary.deferred_locally = delivery == Delivery::Deferred;
        }

        let routed = RoutedRpcEnvelope {
            envelope,
            targets: targets.as_slice().to_vec(),
            expand_to_all: matches!(rpc.metadata.target_rule, TargetRule::All | TargetRule::Others),
            executed_by_originator,
            report_correlation: report_correlation.map(|id| id.0),
            scenario_key,
        };
        self.publish(Some(self.directory.authority_peer()), RpcMessage::Routed(routed), reliable)?;
        summary.forwarded = true;
        Ok(summary)
    }

    /// Validate and deliver an explicit-target call on the authority.
    fn route_targeted(
        &mut self,
        rpc: &RegisteredRpc,
        entity: &dyn NetworkEntity,
        envelope: RpcEnvelope,
        targets: &TargetSet,
        originator_executed: bool,
        scenario_key: Option<&str>,
    ) -> RouteOutcome {
        let local = self.directory.local_peer();
        let reliable = rpc.metadata.is_reliable;
        let connected = self.directory.connected_peers();

        let ctx = ValidationContext {
            source: envelope.originator,
            local,
            targets: targets.as_slice(),
            entity,
            rpc_id: rpc.id,
        };
        let result = self.validation.validate(
            rpc,
            &ctx,
            &envelope.payload,
            scenario_key,
            &connected,
            self.clock.current_time(),
        );

        let mut report = DeliveryReport {
            failure_reason: result.denial_reason().map(str::to_string),
            was_modified: result.was_modified(),
            expect_follow_on_response: result.expects_follow_on_response(),
            ..DeliveryReport::default()
        };
        let outgoing = RpcEnvelope {
            payload: result
                .modified_payload()
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| envelope.payload.clone()),
            ..envelope
        };
        let allowed: Vec<bool> = (0..targets.len()).map(|index| result.is_allowed(index)).collect();
        drop(result);

        let mut local_delivery = None;
        for (peer, allowed) in targets.iter().zip(allowed) {
            if !allowed {
                report.failed_delivery.push(peer);
                continue;
            }
            if peer == outgoing.originator && originator_executed {
                report.delivered_to.push(peer);
                continue;
            }
            if peer == local {
                let source = outgoing.originator;
                local_delivery = Some(self.attempt(self.entry(outgoing.clone(), source, reliable), true));
                report.delivered_to.push(peer);
                continue;
            }
            match self.publish(Some(peer), RpcMessage::Invoke(outgoing.clone()), reliable) {
                Ok(()) => report.delivered_to.push(peer),
                Err(err) => {
                    warn!(rpc = %rpc.qualified_name(), %peer, "Targeted publish failed: {err}");
                    report.failed_delivery.push(peer);
                    report.failure_reason.get_or_insert_with(|| err.to_string());
                }
            }
        }

        if self.persistent.record(&rpc.metadata, &outgoing, entity.owner()) {
            RpcDiagnostics::bump(&self.diagnostics.persistent_recorded);
        }

        RouteOutcome {
            report,
            local: local_delivery,
        }
    }

    fn handle_routed(&mut self, routed: RoutedRpcEnvelope) {
        let originator = routed.envelope.originator;
        let report_correlation = routed.report_correlation;

        let result = self.route_forwarded(routed);
        if let Err(err) = &result {
            warn!(%originator, "Routed RPC rejected: {err}");
        }

        if let Some(correlation_id) = report_correlation {
            let message = RpcMessage::DeliveryReport(DeliveryReportMessage {
                correlation_id,
                report: result.map_err(|err| err.to_string()),
            });
            if let Err(err) = self.publish(Some(originator), message, true) {
                warn!(%originator, "Failed to return delivery report: {err}");
            }
        }
    }

    fn route_forwarded(&mut self, routed: RoutedRpcEnvelope) -> Result<DeliveryReport, RpcError> {
        let rpc_id = routed.envelope.rpc_id;
        let entity_id = routed.envelope.entity_id;
        let rpc = self
            .registry
            .get(rpc_id)
            .cloned()
            .ok_or(RpcError::UnknownRpcId { rpc_id })?;
        if rpc.metadata.kind != RpcKind::ExplicitTarget {
            return Err(RpcError::UnsupportedOperation {
                method: rpc.qualified_name(),
                operation: "routing",
            });
        }
        let entity = self
            .directory
            .lookup_entity(entity_id)
            .ok_or(RpcError::EntityNotFound { entity_id })?;

        let targets = if routed.expand_to_all {
            self.resolve_targets(entity.as_ref(), &rpc, None)?
        } else {
            TargetSet::from_peers(routed.targets)
        };

        let outcome = self.route_targeted(
            &rpc,
            entity.as_ref(),
            routed.envelope,
            &targets,
            routed.executed_by_originator,
            routed.scenario_key.as_deref(),
        );
        Ok(outcome.report)
    }

    /// Deliver an envelope to its local handler, parking it when the entity
    /// or handler is missing.
    fn attempt(&mut self, entry: DeferredRpcEntry, fresh: bool) -> Delivery {
        let local = self.directory.local_peer();
        let envelope = entry.payload.envelope();
        let rpc_id = envelope.rpc_id;
        let entity_id = envelope.entity_id;
        let originator = envelope.originator;
        let correlation_id = envelope.correlation_id;

        let Some(metadata) = self.registry.get(rpc_id).map(|rpc| rpc.metadata.clone()) else {
            let err = RpcError::UnknownRpcId { rpc_id };
            warn!(%originator, "{err}; dropping");
            self.respond(correlation_id, originator, Err(err.to_string()));
            return Delivery::Rejected;
        };

        let Some(entity) = self.directory.lookup_entity(entity_id) else {
            return self.park(entry, fresh, &RpcError::TargetNotReady { entity_id, rpc_id });
        };

        if metadata.kind == RpcKind::AuthorityDirected
            && metadata.is_mine_required
            && self.directory.is_authority()
            && originator != local
            && entity.owner() != originator
        {
            let err = RpcError::NotOwner {
                peer: originator,
                entity_id,
            };
            warn!("{err}; rejecting owner-only RPC {rpc_id}");
            RpcDiagnostics::bump(&self.diagnostics.not_owner_rejections);
            self.respond(correlation_id, originator, Err(err.to_string()));
            return Delivery::Rejected;
        }

        let Some(handler) = self.handlers.get(rpc_id) else {
            return self.park(entry, fresh, &RpcError::HandlerNotRegistered { rpc_id });
        };

        let ctx = RpcContext {
            source: originator,
            local,
            is_reliable: entry.reliable,
            entity_id,
            rpc_id,
            tick: envelope.tick,
            correlation_id,
            is_replay: envelope.replayed,
        };

        match handler(&ctx, entity.as_ref(), &envelope.payload) {
            Invocation::Ready(value) => {
                self.respond(correlation_id, originator, Ok(value));
                if metadata.kind == RpcKind::AuthorityDirected && self.directory.is_authority() {
                    self.relay(metadata.relay, envelope, entity.owner(), metadata.is_reliable);
                }
                Delivery::Executed
            }
            Invocation::NotYetReady => self.park(entry, fresh, &RpcError::TargetNotReady { entity_id, rpc_id }),
            Invocation::Failed(message) => {
                RpcDiagnostics::bump(&self.diagnostics.handler_failures);
                if correlation_id.is_some() {
                    debug!(%rpc_id, entity = %entity_id, "Handler failed; reporting to caller: {message}");
                    self.respond(correlation_id, originator, Err(message));
                } else {
                    warn!(%rpc_id, entity = %entity_id, "RPC handler failed: {message}");
                }
                Delivery::Failed
            }
        }
    }

    fn park(&mut self, mut entry: DeferredRpcEntry, fresh: bool, reason: &RpcError) -> Delivery {
        debug!("{reason}; deferring");
        if fresh {
            // The failed attempt counts against this tick's retry pass.
            entry.last_attempted_tick = Some(self.clock.current_tick());
            RpcDiagnostics::bump(&self.diagnostics.deferred_enqueued);
        }
        self.deferred.enqueue(entry);
        Delivery::Deferred
    }

    fn respond(&self, correlation_id: Option<u64>, to: PeerId, result: Result<Vec<u8>, String>) {
        let Some(correlation_id) = correlation_id else {
            return;
        };
        if to == self.directory.local_peer() {
            self.correlation
                .resolve_response(CorrelationId(correlation_id), result.map_err(RpcError::Remote));
            return;
        }
        let message = RpcMessage::Response(RpcResponse {
            correlation_id,
            result,
        });
        if let Err(err) = self.publish(Some(to), message, true) {
            warn!(peer = %to, "Failed to send RPC response: {err}");
        }
    }

    fn relay(&self, mode: RelayMode, envelope: &RpcEnvelope, owner: PeerId, reliable: bool) {
        let local = self.directory.local_peer();
        let mut recipients = TargetSet::new();
        match mode {
            RelayMode::None => return,
            RelayMode::All => recipients.extend(self.directory.connected_peers()),
            RelayMode::Others => {
                recipients.extend(self.directory.connected_peers());
                recipients.remove(envelope.originator);
            }
            RelayMode::Owner => {
                if owner != local {
                    recipients.push(owner);
                }
            }
        }

        let relayed = RpcEnvelope {
            correlation_id: None,
            ..envelope.clone()
        };
        for peer in recipients.iter() {
            if let Err(err) = self.publish(Some(peer), RpcMessage::Invoke(relayed.clone()), reliable) {
                warn!(%peer, rpc_id = %envelope.rpc_id, "Relay failed: {err}");
            }
        }
    }

    fn replay_applies(&self, record: &PersistentRpcRecord, peer: PeerId) -> bool {
        match record.target_rule {
            TargetRule::All => true,
            TargetRule::Others => record.owner != peer,
            TargetRule::Owner => record.owner == peer,
            TargetRule::PropertyDerived => {
                let Some(entity) = self.directory.lookup_entity(record.envelope.entity_id) else {
                    return false;
                };
                let Some(rpc) = self.registry.get(record.envelope.rpc_id) else {
                    return false;
                };
                self.resolver
                    .resolve(entity.as_ref(), rpc, None, self.directory.as_ref())
                    .map(|targets| targets.contains(peer))
                    .unwrap_or(false)
            }
            TargetRule::SingleAuthority | TargetRule::MultipleAuthorities => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_args;
    use crate::handlers::HandlerOutcome;
    use crate::loopback::{LocalDirectory, LoopbackNetwork};
    use crate::test_support::{ManualClock, TestEntity};
    use meshrpc_core::SimTick;
    use std::time::Duration;

    const AUTHORITY: PeerId = PeerId(1);
    const DOOR: EntityId = EntityId(7);

    struct Peer {
        engine: RpcEngine,
        directory: Arc<LocalDirectory>,
        door: Arc<TestEntity>,
    }

    impl Peer {
        fn spawn(&self, id: EntityId, owner: PeerId) -> Arc<TestEntity> {
            let entity = Arc::new(TestEntity::new(id, "Door", owner));
            self.directory.spawn(entity.clone());
            entity
        }
    }

    struct Session {
        network: LoopbackNetwork,
        clock: Arc<ManualClock>,
        peers: Vec<Peer>,
    }

    impl Session {
        /// Authority 1 plus clients 2 and 3; door 7 exists everywhere, owned by 2.
        fn new() -> Self {
            let mut session = Self {
                network: LoopbackNetwork::new(),
                clock: Arc::new(ManualClock::default()),
                peers: Vec::new(),
            };
            for peer in [1, 2, 3] {
                session.join(PeerId(peer));
            }
            session
        }

        fn join(&mut self, peer: PeerId) {
            let directory = Arc::new(LocalDirectory::new(peer, AUTHORITY));
            let mut engine = RpcEngine::new(
                RpcConfig::default(),
                directory.clone(),
                Arc::new(self.network.transport(peer)),
                self.clock.clone(),
            );
            install(&mut engine);
            self.network.attach(peer, engine.inbound_sender());

            if peer == AUTHORITY {
                for existing in self.peers.iter().skip(1) {
                    directory.connect(existing.directory.local_peer());
                }
            } else {
                directory.connect(AUTHORITY);
                if let Some(authority) = self.peers.first() {
                    authority.directory.connect(peer);
                }
            }

            let door = Arc::new(TestEntity::new(DOOR, "Door", PeerId(2)));
            directory.spawn(door.clone());
            self.peers.push(Peer {
                engine,
                directory,
                door,
            });
        }

        fn peer(&mut self, id: u16) -> &mut Peer {
            &mut self.peers[usize::from(id) - 1]
        }

        fn tick_all(&mut self) {
            self.clock.advance(Duration::from_millis(16));
            for peer in &mut self.peers {
                peer.engine.tick();
            }
        }
    }

    fn install(engine: &mut RpcEngine) {
        let open = engine
            .register_rpc::<(u32,)>("Door", "open", RpcMetadata::authority_directed())
            .unwrap();
        engine
            .register_handler::<TestEntity, (u32,), u32, _>(open, |_ctx, door, (amount,)| {
                door.record(format!("open:{amount}"));
                Ok(HandlerOutcome::Ready(amount * 2))
            })
            .unwrap();

        let announce = engine
            .register_rpc::<(String,)>("Door", "announce", RpcMetadata::broadcast().persistent())
            .unwrap();
        engine
            .register_handler::<TestEntity, (String,), (), _>(announce, |ctx, door, (text,)| {
                door.record(format!("announce:{text}:{}", ctx.is_replay));
                Ok(HandlerOutcome::Ready(()))
            })
            .unwrap();

        let whisper = engine
            .register_rpc::<(Vec<PeerId>, u32)>(
                "Door",
                "whisper",
                RpcMetadata::targeted(TargetRule::MultipleAuthorities)
                    .with_validator("quiet")
                    .with_delivery_report(),
            )
            .unwrap();
        engine
            .register_validator::<(Vec<PeerId>, u32), _>("Door", "quiet", |ctx, _args, result| {
                result.allow_all();
                if let Some(index) = ctx.target_index(PeerId(3)) {
                    result.deny_target(index);
                    result.set_denial_reason("peer#3 is muted");
                }
            })
            .unwrap();
        engine
            .register_handler::<TestEntity, (Vec<PeerId>, u32), (), _>(whisper, |_ctx, door, (_, value)| {
                door.record(format!("whisper:{value}"));
                Ok(HandlerOutcome::Ready(()))
            })
            .unwrap();

        let jam = engine
            .register_rpc::<()>("Door", "jam", RpcMetadata::authority_directed().any_caller())
            .unwrap();
        engine
            .register_handler::<TestEntity, (), (), _>(jam, |_ctx, _door, ()| Err(anyhow::anyhow!("hinge is rusted")))
            .unwrap();
    }

    #[test]
    fn test_owner_call_runs_on_authority() {
        let mut session = Session::new();
        let summary = session.peer(2).engine.call_rpc(DOOR, "open", (5u32,)).unwrap();
        assert_eq!(summary.sent_to, vec![AUTHORITY]);
        assert!(!summary.executed_locally);

        session.tick_all();
        assert_eq!(session.peer(1).door.calls(), vec!["open:5"]);
        assert!(session.peer(2).door.calls().is_empty());
    }

    #[test]
    fn test_non_owner_is_refused_before_sending() {
        let mut session = Session::new();
        let err = session.peer(3).engine.call_rpc(DOOR, "open", (1u32,)).unwrap_err();
        assert_eq!(
            err,
            RpcError::NotOwner {
                peer: PeerId(3),
                entity_id: DOOR
            }
        );
        assert_eq!(session.peer(3).engine.diagnostics().not_owner_rejections, 1);
        assert!(session.network.sent().is_empty());
    }

    #[test]
    fn test_authority_checks_ownership_against_transport_source() {
        let mut session = Session::new();
        let envelope = RpcEnvelope {
            rpc_id: RpcId::of("Door", "open"),
            entity_id: DOOR,
            payload: encode_args(&(1u32,)).unwrap(),
            correlation_id: None,
            // Claims to be the owner.
            originator: PeerId(2),
            tick: SimTick::ZERO,
            replayed: false,
        };

        let authority = session.peer(1);
        authority.engine.receive(PeerId(3), RpcMessage::Invoke(envelope));
        assert!(authority.door.calls().is_empty());
        assert_eq!(authority.engine.diagnostics().not_owner_rejections, 1);
    }

    #[test]
    fn test_async_call_round_trips_return_value() {
        let mut session = Session::new();
        let mut response = session
            .peer(2)
            .engine
            .call_rpc_async::<(u32,), u32>(DOOR, "open", (21,))
            .unwrap();
        assert!(response.try_take().is_none());

        session.tick_all(); // authority executes and replies
        session.tick_all(); // client drains the reply
        assert_eq!(response.try_take(), Some(Ok(42)));
        assert_eq!(session.peer(2).engine.pending_correlations(), 0);
    }

    #[test]
    fn test_async_call_on_authority_resolves_immediately() {
        let mut session = Session::new();
        let mut response = session
            .peer(1)
            .engine
            .call_rpc_async::<(u32,), u32>(DOOR, "open", (3,))
            .unwrap();
        assert_eq!(response.try_take(), Some(Ok(6)));
    }

    #[test]
    fn test_handler_error_reaches_awaiting_caller() {
        let mut session = Session::new();
        let mut response = session
            .peer(3)
            .engine
            .call_rpc_async::<(), ()>(DOOR, "jam", ())
            .unwrap();
        session.tick_all();
        session.tick_all();

        match response.try_take() {
            Some(Err(RpcError::Remote(message))) => assert!(message.contains("hinge is rusted")),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(session.peer(1).engine.diagnostics().handler_failures, 1);
    }

    #[test]
    fn test_async_call_times_out_without_reply() {
        let mut session = Session::new();
        let mut response = session
            .peer(2)
            .engine
            .call_rpc_async::<(u32,), u32>(DOOR, "open", (1,))
            .unwrap();

        session.clock.advance(Duration::from_secs(31));
        session.peer(2).engine.expire_correlations();
        assert!(matches!(
            response.try_take(),
            Some(Err(RpcError::DeliveryTimeout { .. }))
        ));
        assert_eq!(session.peer(2).engine.diagnostics().correlation_timeouts, 1);
    }

    #[test]
    fn test_async_requires_authority_directed() {
        let mut session = Session::new();
        let err = session
            .peer(1)
            .engine
            .call_rpc_async::<(String,), ()>(DOOR, "announce", ("x".into(),))
            .err();
        assert!(matches!(err, Some(RpcError::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_broadcast_from_client_is_rejected() {
        let mut session = Session::new();
        let summary = session
            .peer(2)
            .engine
            .call_rpc(DOOR, "announce", ("hello".to_string(),))
            .unwrap();
        assert!(summary.rejected);
        assert!(session.peer(2).door.calls().is_empty());
        assert_eq!(session.peer(2).engine.diagnostics().broadcast_rejections, 1);
    }

    #[test]
    fn test_broadcast_reaches_every_peer() {
        let mut session = Session::new();
        let summary = session
            .peer(1)
            .engine
            .call_rpc(DOOR, "announce", ("hello".to_string(),))
            .unwrap();
        assert!(summary.executed_locally);
        assert_eq!(summary.sent_to, vec![PeerId(2), PeerId(3)]);

        session.tick_all();
        for id in 1..=3 {
            assert_eq!(session.peer(id).door.calls(), vec!["announce:hello:false"]);
        }
        assert_eq!(session.peer(1).engine.persistent_records(), 1);
    }

    #[test]
    fn test_late_joiner_receives_persistent_broadcast() {
        let mut session = Session::new();
        session
            .peer(1)
            .engine
            .call_rpc(DOOR, "announce", ("first".to_string(),))
            .unwrap();
        session
            .peer(1)
            .engine
            .call_rpc(DOOR, "announce", ("second".to_string(),))
            .unwrap();
        session.tick_all();

        session.join(PeerId(4));
        assert_eq!(session.peer(1).engine.on_peer_joined(PeerId(4)), 1);
        session.tick_all();
        assert_eq!(session.peer(4).door.calls(), vec!["announce:second:true"]);
        assert_eq!(session.peer(1).engine.diagnostics().persistent_replayed, 1);
    }

    #[test]
    fn test_validator_filters_targets_on_authority() {
        let mut session = Session::new();
        let summary = session
            .peer(1)
            .engine
            .call_rpc(DOOR, "whisper", (vec![PeerId(2), PeerId(3)], 9u32))
            .unwrap();
        assert_eq!(summary.sent_to, vec![PeerId(2)]);
        assert_eq!(summary.denied, vec![PeerId(3)]);
        let report = summary.report.unwrap();
        assert_eq!(report.failure_reason.as_deref(), Some("peer#3 is muted"));

        session.tick_all();
        assert_eq!(session.peer(2).door.calls(), vec!["whisper:9"]);
        assert!(session.peer(3).door.calls().is_empty());
    }

    #[test]
    fn test_client_receives_delivery_report() {
        let mut session = Session::new();
        let mut report = session
            .peer(2)
            .engine
            .call_rpc_with_report(DOOR, "whisper", (vec![AUTHORITY, PeerId(3)], 1u32))
            .unwrap();

        session.tick_all();
        session.tick_all();
        let report = report.try_take().unwrap().unwrap();
        assert_eq!(report.delivered_to, vec![AUTHORITY]);
        assert_eq!(report.failed_delivery, vec![PeerId(3)]);
        assert!(!report.fully_delivered());
        assert_eq!(session.peer(1).door.calls(), vec!["whisper:1"]);
    }

    #[test]
    fn test_client_executes_own_target_optimistically() {
        let mut session = Session::new();
        let summary = session
            .peer(2)
            .engine
            .call_rpc(DOOR, "whisper", (vec![PeerId(2)], 4u32))
            .unwrap();
        assert!(summary.executed_locally);
        assert!(summary.forwarded);

        session.tick_all();
        session.tick_all();
        // The authority does not echo the call back to its originator.
        assert_eq!(session.peer(2).door.calls(), vec!["whisper:4"]);
    }

    #[test]
    fn test_missing_entity_is_deferred_then_delivered() {
        let mut session = Session::new();
        let late = EntityId(42);
        session.peer(2).spawn(late, PeerId(2));

        session.peer(2).engine.call_rpc(late, "open", (1u32,)).unwrap();
        session.tick_all();
        assert_eq!(session.peer(1).engine.pending_deferred(), 1);
        assert!(session.peer(1).engine.has_deferred_for(late));

        let entity = session.peer(1).spawn(late, PeerId(2));
        session.tick_all();
        assert_eq!(entity.calls(), vec!["open:1"]);
        assert_eq!(session.peer(1).engine.pending_deferred(), 0);

        let diagnostics = session.peer(1).engine.diagnostics();
        assert_eq!(diagnostics.deferred_enqueued, 1);
        assert_eq!(diagnostics.deferred_delivered, 1);
    }

    #[test]
    fn test_entity_destruction_cancels_deferred() {
        let mut session = Session::new();
        let late = EntityId(42);
        session.peer(2).spawn(late, PeerId(2));
        session.peer(2).engine.call_rpc(late, "open", (1u32,)).unwrap();
        session.peer(2).engine.call_rpc(late, "open", (2u32,)).unwrap();
        session.tick_all();

        let authority = session.peer(1);
        assert_eq!(authority.engine.on_entity_destroyed(late), 2);
        assert_eq!(authority.engine.pending_deferred(), 0);
        assert_eq!(authority.engine.diagnostics().deferred_cancelled, 2);
    }

    #[test]
    fn test_deferred_call_times_out() {
        let mut session = Session::new();
        let late = EntityId(42);
        session.peer(2).spawn(late, PeerId(2));
        session.peer(2).engine.call_rpc(late, "open", (1u32,)).unwrap();
        session.tick_all();

        session.clock.advance(Duration::from_secs(11));
        let report = session.peer(1).engine.process_deferred_retries();
        assert_eq!(report.timed_out.len(), 1);
        assert_eq!(session.peer(1).engine.pending_deferred(), 0);
        assert_eq!(session.peer(1).engine.diagnostics().deferred_timed_out, 1);
    }

    #[test]
    fn test_call_errors() {
        let mut session = Session::new();
        let engine = &mut session.peer(1).engine;
        assert!(matches!(
            engine.call_rpc(DOOR, "slam", ()),
            Err(RpcError::UnknownRpc { .. })
        ));
        assert!(matches!(
            engine.call_rpc(DOOR, "open", ()),
            Err(RpcError::ArityMismatch {
                expected: 1,
                actual: 0,
                ..
            })
        ));
        assert_eq!(
            engine.call_rpc(EntityId(99), "open", (1u32,)),
            Err(RpcError::EntityNotFound {
                entity_id: EntityId(99)
            })
        );
    }

    #[test]
    fn test_validator_arity_is_checked_both_ways() {
        let mut session = Session::new();
        let engine = &mut session.peer(1).engine;
        let err = engine
            .register_validator::<(u32,), _>("Door", "quiet", |_ctx, _args, result| result.allow_all())
            .unwrap_err();
        assert!(matches!(err, RpcError::ArityMismatch { .. }));

        let err = engine
            .register_rpc::<()>(
                "Door",
                "shout",
                RpcMetadata::targeted(TargetRule::All).with_validator("quiet"),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::ArityMismatch { .. }));
    }
}
