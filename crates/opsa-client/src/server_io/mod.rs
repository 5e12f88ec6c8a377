//! The server I/O engine.
//!
//! [`ServerIo`] owns every request and subscription record. All transitions
//! run to completion under one lock; subscription handlers are collected as
//! effects and invoked after the lock is released.
//!
//! The engine never touches a socket. [`ServerIo::attach`] hands it a
//! [`FrameSink`] for the current transport and replays whatever must survive
//! a reconnect; [`ServerIo::detach`] reconciles state left by a lost
//! transport.

use std::sync::Arc;

use opsa_core::frames::{self, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};
use opsa_core::{
    ClientError, CorrelationId, IdAllocator, InboundFrame, NotificationKind, OutboundFrame,
    PeerSubscriptionId, Result, SubscriptionId, decode_frame,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::deferred::Deferred;
use crate::handler::{ChannelHandler, SubscriptionEvent, SubscriptionHandler};
use crate::requests::{
    CancelOutcome, PendingRequest, RequestHandle, RequestOrigin, RequestRecord, RequestState,
    RequestTable,
};
use crate::subscriptions::{
    ActiveSubscription, SubscriptionHandle, SubscriptionRecord, SubscriptionState,
    SubscriptionTable,
};
use crate::transport::FrameSink;

/// Handler work deferred until the engine lock is released.
enum Effect {
    Update(Arc<dyn SubscriptionHandler>, Value),
    Remove(Arc<dyn SubscriptionHandler>),
}

impl Effect {
    fn run(self) {
        match self {
            Self::Update(handler, value) => handler.on_update(&value),
            Self::Remove(handler) => handler.on_remove(),
        }
    }
}

#[derive(Default)]
struct Inner {
    sink: Option<Arc<dyn FrameSink>>,
    correlation: IdAllocator,
    subscription_ids: IdAllocator,
    requests: RequestTable,
    subscriptions: SubscriptionTable,
}

fn transmit(sink: Option<&Arc<dyn FrameSink>>, frame: &str) -> bool {
    let Some(sink) = sink else {
        return false;
    };
    match sink.send(frame.to_owned()) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to hand frame to transport");
            false
        }
    }
}

impl Inner {
    fn transmit(&self, frame: &str) -> bool {
        transmit(self.sink.as_ref(), frame)
    }

    fn next_index(&mut self) -> CorrelationId {
        CorrelationId::new(self.correlation.next_raw())
    }

    /// Send everything that is not on the current transport yet.
    /// Returns `(requests, subscriptions)` sent.
    fn replay(&mut self) -> (usize, usize) {
        let mut requests = 0;
        let sink = self.sink.as_ref();
        for (index, record) in self.requests.waiting_mut() {
            if !transmit(sink, &record.frame) {
                debug!(index = %index, "replay stopped, transport refused frame");
                break;
            }
            record.state = RequestState::Sent;
            requests += 1;
        }

        let mut subscriptions = 0;
        for id in self.subscriptions.needing_subscribe() {
            if self.send_subscribe(id) {
                subscriptions += 1;
            }
        }
        (requests, subscriptions)
    }

    fn detach(&mut self) {
        self.sink = None;
        let requests = self.requests.detach();
        let subscriptions = self.subscriptions.detach();
        info!(
            requeued = requests.requeued,
            canceled = requests.canceled,
            dropped_frames = requests.dropped_internal,
            resubscribe = subscriptions.demoted,
            unsubscribed = subscriptions.finalized,
            "transport detached"
        );
    }

    /// Send a subscribe frame for `id`. Returns whether it reached the transport;
    /// if not, the subscription is picked up again on the next attach.
    fn send_subscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(record) = self.subscriptions.get(id) else {
            return false;
        };
        let data = record.data.clone();
        let index = self.next_index();
        let frame = match OutboundFrame::request(index, SUBSCRIBE_METHOD, data).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(subscription = %id, error = %e, "failed to encode subscribe frame");
                return false;
            }
        };
        if !self.transmit(&frame) {
            return false;
        }
        if let Some(record) = self.subscriptions.get_mut(id) {
            record.pending = Some(index);
            record.set_state(SubscriptionState::Subscribing);
            debug!(subscription = %id, topic = %record.topic, index = %index, "subscribe sent");
        }
        self.requests.insert(
            index,
            RequestRecord {
                method: SUBSCRIBE_METHOD.into(),
                frame,
                state: RequestState::Sent,
                origin: RequestOrigin::Subscribe(id),
            },
        );
        true
    }

    /// Send an unsubscribe frame for a bound subscription and move it to
    /// `Unsubscribing`. Without a bound peer index there is nothing to tell the
    /// peer, so the subscription ends here.
    fn send_unsubscribe(&mut self, id: SubscriptionId, peer: Option<PeerSubscriptionId>) {
        let Some(peer) = peer else {
            let _ = self.subscriptions.finalize(id, ClientError::Canceled);
            return;
        };
        let index = self.next_index();
        let frame =
            match OutboundFrame::request(index, UNSUBSCRIBE_METHOD, frames::unsubscribe_data(peer))
                .encode()
            {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(subscription = %id, error = %e, "failed to encode unsubscribe frame");
                    let _ = self.subscriptions.finalize(id, ClientError::Canceled);
                    return;
                }
            };
        let sent = self.transmit(&frame);
        if let Some(record) = self.subscriptions.get_mut(id) {
            record.pending = sent.then_some(index);
            record.set_state(SubscriptionState::Unsubscribing);
        }
        if sent {
            debug!(subscription = %id, peer_index = %peer, index = %index, "unsubscribe sent");
            self.requests.insert(
                index,
                RequestRecord {
                    method: UNSUBSCRIBE_METHOD.into(),
                    frame,
                    state: RequestState::Sent,
                    origin: RequestOrigin::Unsubscribe(id),
                },
            );
        }
    }

    fn cancel_subscription(&mut self, id: SubscriptionId) -> Result<()> {
        let Some(record) = self.subscriptions.get(id) else {
            return Err(ClientError::AlreadyCanceled);
        };
        match record.state() {
            SubscriptionState::WaitingForSocket => {
                let _ = self.subscriptions.finalize(id, ClientError::Canceled);
            }
            SubscriptionState::Subscribing => {
                if record.pending.is_none() {
                    let _ = self.subscriptions.finalize(id, ClientError::Canceled);
                } else {
                    let _ = record.first_value.reject(ClientError::Canceled);
                    record.set_state(SubscriptionState::UnsubscribingWhileSubscribing);
                }
            }
            SubscriptionState::Subscribed => {
                let peer = record.server_index;
                let _ = record.first_value.reject(ClientError::Canceled);
                self.send_unsubscribe(id, peer);
            }
            SubscriptionState::Unsubscribing
            | SubscriptionState::UnsubscribingWhileSubscribing
            | SubscriptionState::Unsubscribed => return Err(ClientError::AlreadyCanceled),
        }
        debug!(subscription = %id, "subscription canceled");
        Ok(())
    }

    fn dispatch(&mut self, frame: InboundFrame) -> Vec<Effect> {
        let mut effects = Vec::new();
        match frame {
            InboundFrame::Response { index, data } => self.on_response(index, data, &mut effects),
            InboundFrame::Notification { index, kind } => {
                self.on_notification(index, kind, &mut effects);
            }
        }
        effects
    }

    fn on_response(&mut self, index: CorrelationId, data: Value, effects: &mut Vec<Effect>) {
        let Some(record) = self.requests.remove(index) else {
            warn!(index = %index, "response for unknown index");
            return;
        };
        match record.origin {
            RequestOrigin::Caller { response, cancel } => match record.state {
                RequestState::Canceling => {
                    debug!(index = %index, "late response for canceled request");
                    if let Some(cancel) = cancel {
                        let _ = cancel.resolve(Some(data));
                    }
                }
                RequestState::Sent | RequestState::WaitingForSocket => {
                    debug!(index = %index, method = %record.method, "request returned");
                    let _ = response.resolve(data);
                }
            },
            RequestOrigin::Subscribe(id) => self.on_subscribe_ack(id, index, &data, effects),
            RequestOrigin::Unsubscribe(id) => self.on_unsubscribe_ack(id, index),
        }
    }

    fn on_subscribe_ack(
        &mut self,
        id: SubscriptionId,
        index: CorrelationId,
        data: &Value,
        effects: &mut Vec<Effect>,
    ) {
        let Some(record) = self.subscriptions.get_mut(id) else {
            debug!(subscription = %id, "subscribe ack for finished subscription");
            return;
        };
        if record.pending != Some(index) {
            debug!(subscription = %id, index = %index, "stale subscribe ack");
            return;
        }
        record.pending = None;
        let state = record.state();

        let peer = match frames::parse_subscribe_ack(data) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(subscription = %id, topic = %record.topic, error = %e, "subscribe rejected");
                if let Some(record) = self.subscriptions.finalize(id, e) {
                    if state == SubscriptionState::Subscribing {
                        effects.push(Effect::Remove(record.handler));
                    }
                }
                return;
            }
        };

        match state {
            SubscriptionState::Subscribing => {
                self.subscriptions.bind(id, peer);
                if let Some(record) = self.subscriptions.get(id) {
                    record.set_state(SubscriptionState::Subscribed);
                    debug!(subscription = %id, topic = %record.topic, peer_index = %peer, "subscribed");
                }
            }
            SubscriptionState::UnsubscribingWhileSubscribing => {
                self.subscriptions.bind(id, peer);
                self.send_unsubscribe(id, Some(peer));
            }
            other => debug!(subscription = %id, state = %other, "subscribe ack ignored"),
        }
    }

    fn on_unsubscribe_ack(&mut self, id: SubscriptionId, index: CorrelationId) {
        let current = self.subscriptions.get(id).is_some_and(|r| {
            r.pending == Some(index) && r.state() == SubscriptionState::Unsubscribing
        });
        if current {
            let _ = self.subscriptions.finalize(id, ClientError::Canceled);
            debug!(subscription = %id, "unsubscribed");
        } else {
            debug!(subscription = %id, index = %index, "stale unsubscribe ack");
        }
    }

    fn on_notification(
        &mut self,
        peer: PeerSubscriptionId,
        kind: NotificationKind,
        effects: &mut Vec<Effect>,
    ) {
        let Some(id) = self.subscriptions.by_peer(peer) else {
            warn!(peer_index = %peer, "notification for unknown subscription index");
            return;
        };
        let Some(record) = self.subscriptions.get(id) else {
            return;
        };
        let state = record.state();
        if state != SubscriptionState::Subscribed {
            debug!(subscription = %id, state = %state, "notification ignored");
            return;
        }

        match kind {
            NotificationKind::Update(value) => {
                let _ = record.latest.send_replace(Some(value.clone()));
                let _ = record.first_value.resolve(value.clone());
                effects.push(Effect::Update(Arc::clone(&record.handler), value));
            }
            NotificationKind::Remove => {
                if let Some(record) = self.subscriptions.finalize(id, ClientError::Removed) {
                    info!(subscription = %id, topic = %record.topic, "subscription removed by server");
                    effects.push(Effect::Remove(record.handler));
                }
            }
        }
    }
}

/// Request/subscription engine. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ServerIo {
    inner: Arc<Mutex<Inner>>,
}

impl ServerIo {
    /// Create a detached engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the sink of a newly opened transport and replay pending work:
    /// waiting requests in index order with their original frames, then one
    /// fresh subscribe frame per subscription that is not on the wire.
    ///
    /// Attaching while attached detaches first.
    pub fn attach(&self, sink: Arc<dyn FrameSink>) {
        let mut inner = self.inner.lock();
        if inner.sink.is_some() {
            debug!("attach while attached, detaching previous transport");
            inner.detach();
        }
        inner.sink = Some(sink);
        let (requests, subscriptions) = inner.replay();
        info!(requests, subscriptions, "transport attached");
    }

    /// Forget the current transport and reconcile state it leaves behind.
    /// No-op when already detached.
    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        if inner.sink.is_none() {
            return;
        }
        inner.detach();
    }

    /// Whether a transport sink is installed.
    pub fn is_attached(&self) -> bool {
        self.inner.lock().sink.is_some()
    }

    /// Route one inbound text frame. Malformed frames and frames for unknown
    /// indices are logged and dropped.
    pub fn handle_message(&self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "dropping inbound frame");
                return;
            }
        };
        let effects = {
            let mut inner = self.inner.lock();
            if inner.sink.is_none() {
                debug!("frame received while detached, dropping");
                return;
            }
            inner.dispatch(frame)
        };
        for effect in effects {
            effect.run();
        }
    }

    /// Issue an RPC. Sent immediately when attached, otherwise on the next
    /// attach.
    pub fn request(&self, method: impl Into<String>, data: Value) -> Result<RequestHandle> {
        let method = method.into();
        let mut inner = self.inner.lock();
        let index = inner.next_index();
        let frame = OutboundFrame::request(index, method.clone(), data).encode()?;
        let response = Deferred::new();
        let promise = response.promise();
        let state = if inner.transmit(&frame) {
            RequestState::Sent
        } else {
            RequestState::WaitingForSocket
        };
        debug!(index = %index, method = %method, ?state, "request issued");
        inner.requests.insert(
            index,
            RequestRecord {
                method,
                frame,
                state,
                origin: RequestOrigin::Caller {
                    response,
                    cancel: None,
                },
            },
        );
        drop(inner);
        Ok(RequestHandle::new(self.clone(), index, promise))
    }

    /// Subscribe to `topic`. `filter` is `null` or an object whose keys are
    /// sent alongside the topic name.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        filter: Value,
        handler: impl SubscriptionHandler,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_with(topic, filter, Arc::new(handler))
    }

    /// [`subscribe`](Self::subscribe) with a shared handler.
    pub fn subscribe_with(
        &self,
        topic: impl Into<String>,
        filter: Value,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionHandle> {
        let topic = topic.into();
        let data = frames::subscribe_data(&topic, &filter)?;
        let mut inner = self.inner.lock();
        let id = SubscriptionId::new(inner.subscription_ids.next_raw());
        let record = SubscriptionRecord::new(topic, data, handler);
        let handle = SubscriptionHandle::new(self.clone(), id, &record);
        inner.subscriptions.insert(id, record);
        if inner.sink.is_some() {
            let _ = inner.send_subscribe(id);
        }
        debug!(subscription = %id, topic = %handle.topic(), "subscription created");
        Ok(handle)
    }

    /// Subscribe with a [`ChannelHandler`] and return its receiver.
    pub fn subscribe_channel(
        &self,
        topic: impl Into<String>,
        filter: Value,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent>)> {
        let (handler, rx) = ChannelHandler::new();
        let handle = self.subscribe(topic, filter, handler)?;
        Ok((handle, rx))
    }

    /// Outstanding caller requests, lowest index first.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.inner.lock().requests.summaries()
    }

    /// Subscriptions that have not reached `Unsubscribed`.
    pub fn active_subscriptions(&self) -> Vec<ActiveSubscription> {
        self.inner.lock().subscriptions.summaries()
    }

    pub(crate) fn cancel_request(&self, index: CorrelationId) -> Result<CancelOutcome> {
        let outcome = self.inner.lock().requests.cancel(index);
        match &outcome {
            Ok(CancelOutcome::Immediate) => debug!(index = %index, "request canceled before send"),
            Ok(CancelOutcome::Pending(_)) => debug!(index = %index, "request canceling"),
            Err(e) => debug!(index = %index, error = %e, "cancel refused"),
        }
        outcome
    }

    pub(crate) fn cancel_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.inner.lock().cancel_subscription(id)
    }
}

impl std::fmt::Debug for ServerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIo")
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
