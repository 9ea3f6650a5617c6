//! Correlation of asynchronous calls with their responses.
//!
//! Each pending call owns a oneshot sender. Resolution removes the entry
//! under the lock before sending, so a correlation resolves at most once no
//! matter whether the response, a failure or the timeout gets there first.

use crate::codec::decode_args;
use crate::diagnostics::RpcDiagnostics;
use crate::error::RpcError;
use crate::protocol::DeliveryReport;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Process-unique id of an asynchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr#{}", self.0)
    }
}

type ResponseSlot = oneshot::Sender<Result<Vec<u8>, RpcError>>;
type ReportSlot = oneshot::Sender<Result<DeliveryReport, RpcError>>;

enum Continuation {
    Response(ResponseSlot),
    DeliveryReport(ReportSlot),
}

impl Continuation {
    fn fail(self, err: RpcError) {
        // The caller may have dropped its future; nothing left to notify.
        match self {
            Continuation::Response(slot) => {
                let _ = slot.send(Err(err));
            }
            Continuation::DeliveryReport(slot) => {
                let _ = slot.send(Err(err));
            }
        }
    }
}

struct PendingEntry {
    continuation: Continuation,
    registered_at: Duration,
    deadline: Duration,
}

/// Pending asynchronous calls keyed by correlation id.
pub struct CorrelationTracker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingEntry>>,
    diagnostics: Arc<RpcDiagnostics>,
}

impl CorrelationTracker {
    /// Empty tracker.
    pub fn new(diagnostics: Arc<RpcDiagnostics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            diagnostics,
        }
    }

    /// Allocate a fresh correlation id.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a pending response; it times out `timeout` after `now`.
    pub fn register_response<R: DeserializeOwned>(
        &self,
        id: CorrelationId,
        now: Duration,
        timeout: Duration,
    ) -> ResponseFuture<R> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Continuation::Response(tx), now, timeout);
        ResponseFuture::pending(rx)
    }

    /// Register a pending delivery report; it times out `timeout` after `now`.
    pub fn register_report(&self, id: CorrelationId, now: Duration, timeout: Duration) -> DeliveryReportFuture {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Continuation::DeliveryReport(tx), now, timeout);
        DeliveryReportFuture::pending(rx)
    }

    /// Resolve a pending response. Returns `false` if the id was not pending.
    pub fn resolve_response(&self, id: CorrelationId, result: Result<Vec<u8>, RpcError>) -> bool {
        match self.take(id) {
            Some(Continuation::Response(slot)) => {
                let _ = slot.send(result);
                true
            }
            Some(other) => {
                warn!(%id, "Response arrived for a delivery-report correlation");
                other.fail(RpcError::Codec("response arrived for a delivery report".into()));
                true
            }
            None => {
                self.late(id, "response");
                false
            }
        }
    }

    /// Resolve a pending delivery report. Returns `false` if the id was not
    /// pending.
    pub fn resolve_report(&self, id: CorrelationId, result: Result<DeliveryReport, RpcError>) -> bool {
        match self.take(id) {
            Some(Continuation::DeliveryReport(slot)) => {
                let _ = slot.send(result);
                true
            }
            Some(other) => {
                warn!(%id, "Delivery report arrived for a response correlation");
                other.fail(RpcError::Codec("delivery report arrived for a response".into()));
                true
            }
            None => {
                self.late(id, "delivery report");
                false
            }
        }
    }

    /// Fail a pending call explicitly.
    pub fn fail(&self, id: CorrelationId, err: RpcError) -> bool {
        match self.take(id) {
            Some(continuation) => {
                continuation.fail(err);
                true
            }
            None => false,
        }
    }

    /// Resolve every call whose deadline has passed with `DeliveryTimeout`.
    pub fn expire(&self, now: Duration) -> usize {
        let expired: Vec<(CorrelationId, PendingEntry)> = match self.pending.lock() {
            Ok(mut pending) => {
                let ids: Vec<CorrelationId> = pending
                    .iter()
                    .filter(|(_, entry)| now >= entry.deadline)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                    .collect()
            }
            Err(_) => return 0,
        };

        let count = expired.len();
        for (id, entry) in expired {
            let after = now.saturating_sub(entry.registered_at);
            debug!(%id, ?after, "Correlation timed out");
            entry.continuation.fail(RpcError::DeliveryTimeout {
                correlation_id: id.0,
                after,
            });
        }
        RpcDiagnostics::add(&self.diagnostics.correlation_timeouts, count as u64);
        count
    }

    /// Calls still awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    fn insert(&self, id: CorrelationId, continuation: Continuation, now: Duration, timeout: Duration) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id,
                PendingEntry {
                    continuation,
                    registered_at: now,
                    deadline: now + timeout,
                },
            );
        }
    }

    fn take(&self, id: CorrelationId) -> Option<Continuation> {
        self.pending
            .lock()
            .ok()?
            .remove(&id)
            .map(|entry| entry.continuation)
    }

    fn late(&self, id: CorrelationId, what: &str) {
        debug!(%id, "Discarding late {what}");
        RpcDiagnostics::bump(&self.diagnostics.late_resolutions);
    }
}

enum Slot<T> {
    Pending(oneshot::Receiver<Result<T, RpcError>>),
    Ready(Option<Result<T, RpcError>>),
}

impl<T> Slot<T> {
    fn poll_raw(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, RpcError>> {
        match self {
            Slot::Ready(value) => Poll::Ready(value.take().unwrap_or(Err(RpcError::ContinuationDropped))),
            Slot::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ContinuationDropped)),
            },
        }
    }

    fn try_raw(&mut self) -> Option<Result<T, RpcError>> {
        match self {
            Slot::Ready(value) => value.take(),
            Slot::Pending(rx) => match rx.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(RpcError::ContinuationDropped)),
            },
        }
    }
}

/// Typed result of `call_rpc_async`.
///
/// Await it from async code, or poll it with [`ResponseFuture::try_take`]
/// from the simulation loop.
pub struct ResponseFuture<R> {
    slot: Slot<Vec<u8>>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> ResponseFuture<R> {
    fn pending(rx: oneshot::Receiver<Result<Vec<u8>, RpcError>>) -> Self {
        Self {
            slot: Slot::Pending(rx),
            _result: PhantomData,
        }
    }

    /// Already-resolved response (local execution).
    pub fn ready(result: Result<Vec<u8>, RpcError>) -> Self {
        Self {
            slot: Slot::Ready(Some(result)),
            _result: PhantomData,
        }
    }

    /// Take the result if it has arrived.
    pub fn try_take(&mut self) -> Option<Result<R, RpcError>> {
        self.slot.try_raw().map(|raw| raw.and_then(|bytes| decode_args(&bytes)))
    }
}

impl<R: DeserializeOwned> Future for ResponseFuture<R> {
    type Output = Result<R, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot
            .poll_raw(cx)
            .map(|raw| raw.and_then(|bytes| decode_args(&bytes)))
    }
}

/// Delivery report of `call_rpc_with_report`.
pub struct DeliveryReportFuture {
    slot: Slot<DeliveryReport>,
}

impl DeliveryReportFuture {
    fn pending(rx: oneshot::Receiver<Result<DeliveryReport, RpcError>>) -> Self {
        Self {
            slot: Slot::Pending(rx),
        }
    }

    /// Already-assembled report (local authority).
    pub fn ready(result: Result<DeliveryReport, RpcError>) -> Self {
        Self {
            slot: Slot::Ready(Some(result)),
        }
    }

    /// Take the report if it has arrived.
    pub fn try_take(&mut self) -> Option<Result<DeliveryReport, RpcError>> {
        self.slot.try_raw()
    }
}

impl Future for DeliveryReportFuture {
    type Output = Result<DeliveryReport, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.poll_raw(cx)
    }
}
