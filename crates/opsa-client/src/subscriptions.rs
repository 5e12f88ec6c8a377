//! Subscription tracker.
//!
//! A subscription keeps its local [`SubscriptionId`] for its whole life; the
//! peer-assigned [`PeerSubscriptionId`] is bound per transport and purged on
//! every detach, so a notification can only reach the subscription that the
//! current transport acknowledged.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use opsa_core::{ClientError, CorrelationId, PeerSubscriptionId, Result, SubscriptionId};
use serde_json::Value;
use tokio::sync::watch;

use crate::deferred::{Deferred, Promise};
use crate::handler::SubscriptionHandler;
use crate::server_io::ServerIo;

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// No transport; subscribe goes out on the next attach.
    WaitingForSocket,
    /// Subscribe frame sent (or to be re-sent); no ack yet.
    Subscribing,
    /// Acked; notifications are delivered.
    Subscribed,
    /// Unsubscribe frame sent.
    Unsubscribing,
    /// Canceled while the subscribe frame was in flight; the unsubscribe
    /// goes out once the ack reveals the peer index.
    UnsubscribingWhileSubscribing,
    /// Terminal.
    Unsubscribed,
}

impl SubscriptionState {
    /// Short name for logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForSocket => "waiting_for_socket",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Unsubscribing => "unsubscribing",
            Self::UnsubscribingWhileSubscribing => "unsubscribing_while_subscribing",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    /// Whether a cancel is already under way or done.
    pub fn is_unsubscribing(self) -> bool {
        matches!(
            self,
            Self::Unsubscribing | Self::UnsubscribingWhileSubscribing | Self::Unsubscribed
        )
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct SubscriptionRecord {
    pub(crate) topic: String,
    /// Data of the subscribe frame, re-sent verbatim on every attach.
    pub(crate) data: Value,
    pub(crate) state: watch::Sender<SubscriptionState>,
    pub(crate) server_index: Option<PeerSubscriptionId>,
    /// Correlation index of the subscribe or unsubscribe frame in flight.
    pub(crate) pending: Option<CorrelationId>,
    pub(crate) latest: watch::Sender<Option<Value>>,
    pub(crate) handler: Arc<dyn SubscriptionHandler>,
    pub(crate) first_value: Deferred<Value>,
}

impl SubscriptionRecord {
    pub(crate) fn new(topic: String, data: Value, handler: Arc<dyn SubscriptionHandler>) -> Self {
        let (state, _) = watch::channel(SubscriptionState::WaitingForSocket);
        let (latest, _) = watch::channel(None);
        Self {
            topic,
            data,
            state,
            server_index: None,
            pending: None,
            latest,
            handler,
            first_value: Deferred::new(),
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        let _ = self.state.send_replace(state);
    }
}

/// Counts from reconciling the table with a lost transport.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DetachOutcome {
    pub(crate) demoted: usize,
    pub(crate) finalized: usize,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    records: BTreeMap<SubscriptionId, SubscriptionRecord>,
    peer_index: HashMap<PeerSubscriptionId, SubscriptionId>,
}

impl SubscriptionTable {
    pub(crate) fn insert(&mut self, id: SubscriptionId, record: SubscriptionRecord) {
        let _ = self.records.insert(id, record);
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Option<&SubscriptionRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SubscriptionId) -> Option<&mut SubscriptionRecord> {
        self.records.get_mut(&id)
    }

    pub(crate) fn by_peer(&self, peer: PeerSubscriptionId) -> Option<SubscriptionId> {
        self.peer_index.get(&peer).copied()
    }

    /// Bind a peer index acknowledged on the current transport.
    pub(crate) fn bind(&mut self, id: SubscriptionId, peer: PeerSubscriptionId) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        record.server_index = Some(peer);
        if let Some(previous) = self.peer_index.insert(peer, id) {
            if previous != id {
                tracing::warn!(
                    peer_index = %peer,
                    previous = %previous,
                    subscription = %id,
                    "peer reused a live subscription index"
                );
            }
        }
    }

    /// Remove the record and move it to `Unsubscribed`. `first_value` is
    /// rejected with `reason` unless it already resolved.
    pub(crate) fn finalize(
        &mut self,
        id: SubscriptionId,
        reason: ClientError,
    ) -> Option<SubscriptionRecord> {
        let record = self.records.remove(&id)?;
        if let Some(peer) = record.server_index {
            if self.peer_index.get(&peer) == Some(&id) {
                let _ = self.peer_index.remove(&peer);
            }
        }
        let _ = record.first_value.reject(reason);
        record.set_state(SubscriptionState::Unsubscribed);
        Some(record)
    }

    /// Subscriptions that need a fresh subscribe frame on the current transport.
    pub(crate) fn needing_subscribe(&self) -> Vec<SubscriptionId> {
        self.records
            .iter()
            .filter(|(_, r)| match r.state() {
                SubscriptionState::WaitingForSocket => true,
                SubscriptionState::Subscribing => r.pending.is_none(),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Reconcile with a lost transport.
    pub(crate) fn detach(&mut self) -> DetachOutcome {
        self.peer_index.clear();
        let mut outcome = DetachOutcome::default();
        let mut finished = Vec::new();
        for (id, record) in &mut self.records {
            match record.state() {
                SubscriptionState::Subscribing | SubscriptionState::Subscribed => {
                    record.server_index = None;
                    record.pending = None;
                    record.set_state(SubscriptionState::Subscribing);
                    outcome.demoted += 1;
                }
                SubscriptionState::Unsubscribing
                | SubscriptionState::UnsubscribingWhileSubscribing => {
                    record.server_index = None;
                    finished.push(*id);
                }
                SubscriptionState::WaitingForSocket | SubscriptionState::Unsubscribed => {}
            }
        }
        for id in finished {
            if self.finalize(id, ClientError::Canceled).is_some() {
                outcome.finalized += 1;
            }
        }
        outcome
    }

    pub(crate) fn summaries(&self) -> Vec<ActiveSubscription> {
        self.records
            .iter()
            .map(|(id, r)| ActiveSubscription {
                id: *id,
                topic: r.topic.clone(),
                state: r.state(),
                server_index: r.server_index,
            })
            .collect()
    }
}

/// Snapshot of one live subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSubscription {
    /// Local id.
    pub id: SubscriptionId,
    /// Topic name.
    pub topic: String,
    /// Current state.
    pub state: SubscriptionState,
    /// Peer index on the current transport, once acked.
    pub server_index: Option<PeerSubscriptionId>,
}

/// Caller's handle on one subscription.
///
/// Dropping the handle does not cancel the subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    io: ServerIo,
    id: SubscriptionId,
    topic: String,
    state: watch::Receiver<SubscriptionState>,
    latest: watch::Receiver<Option<Value>>,
    first_value: Promise<Value>,
}

impl SubscriptionHandle {
    pub(crate) fn new(io: ServerIo, id: SubscriptionId, record: &SubscriptionRecord) -> Self {
        Self {
            io,
            id,
            topic: record.topic.clone(),
            state: record.state.subscribe(),
            latest: record.latest.subscribe(),
            first_value: record.first_value.promise(),
        }
    }

    /// Local id of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// The most recent value. Fails with [`ClientError::NoValueYet`] before
    /// the first update.
    pub fn value(&self) -> Result<Value> {
        self.latest.borrow().clone().ok_or(ClientError::NoValueYet)
    }

    /// Wait for the first value. Fails with [`ClientError::Canceled`] if the
    /// subscription is canceled first, or [`ClientError::Removed`] if the
    /// peer removes it first.
    pub async fn wait(&self) -> Result<Value> {
        self.first_value.wait().await
    }

    /// Wait until the value changes, then return it. Returns `None` once the
    /// subscription has ended.
    pub async fn next_value(&mut self) -> Option<Value> {
        self.latest.changed().await.ok()?;
        self.latest.borrow_and_update().clone()
    }

    /// Unsubscribe.
    ///
    /// The transition happens immediately; no update reaches the handler
    /// afterwards. The returned future resolves once the subscription is
    /// `Unsubscribed`, which may take one round trip or one detach. A second
    /// call fails with [`ClientError::AlreadyCanceled`].
    pub fn cancel(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let outcome = self.io.cancel_subscription(self.id);
        let mut state = self.state.clone();
        async move {
            outcome?;
            let _ = state
                .wait_for(|s| *s == SubscriptionState::Unsubscribed)
                .await;
            Ok(())
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopHandler;
    use serde_json::json;

    fn record(topic: &str) -> SubscriptionRecord {
        SubscriptionRecord::new(topic.into(), json!({"name": topic}), Arc::new(NoopHandler))
    }

    #[test]
    fn bind_and_lookup() {
        let mut table = SubscriptionTable::default();
        let id = SubscriptionId::new(0);
        table.insert(id, record("listfiles"));
        table.bind(id, PeerSubscriptionId::new(7));

        assert_eq!(table.by_peer(PeerSubscriptionId::new(7)), Some(id));
        assert_eq!(
            table.get(id).and_then(|r| r.server_index),
            Some(PeerSubscriptionId::new(7))
        );
    }

    #[tokio::test]
    async fn finalize_unbinds_and_rejects() {
        let mut table = SubscriptionTable::default();
        let id = SubscriptionId::new(0);
        let rec = record("ccdiscovery");
        let first = rec.first_value.promise();
        let mut state = rec.state.subscribe();
        table.insert(id, rec);
        table.bind(id, PeerSubscriptionId::new(3));

        assert!(table.finalize(id, ClientError::Removed).is_some());
        assert_eq!(table.by_peer(PeerSubscriptionId::new(3)), None);
        assert_eq!(first.wait().await, Err(ClientError::Removed));
        assert_eq!(*state.borrow_and_update(), SubscriptionState::Unsubscribed);
        assert!(table.finalize(id, ClientError::Removed).is_none());
    }

    #[test]
    fn detach_demotes_and_finalizes() {
        let mut table = SubscriptionTable::default();
        let states = [
            SubscriptionState::WaitingForSocket,
            SubscriptionState::Subscribing,
            SubscriptionState::Subscribed,
            SubscriptionState::Unsubscribing,
            SubscriptionState::UnsubscribingWhileSubscribing,
        ];
        for (raw, state) in (0_u64..).zip(states) {
            let rec = record("t");
            rec.set_state(state);
            table.insert(SubscriptionId::new(raw), rec);
            if state != SubscriptionState::WaitingForSocket {
                table.bind(SubscriptionId::new(raw), PeerSubscriptionId::new(raw));
            }
        }

        let outcome = table.detach();
        assert_eq!(outcome, DetachOutcome { demoted: 2, finalized: 2 });
        assert!(table.by_peer(PeerSubscriptionId::new(2)).is_none());

        let remaining: Vec<_> = table
            .summaries()
            .into_iter()
            .map(|s| (s.id.get(), s.state, s.server_index))
            .collect();
        assert_eq!(
            remaining,
            vec![
                (0, SubscriptionState::WaitingForSocket, None),
                (1, SubscriptionState::Subscribing, None),
                (2, SubscriptionState::Subscribing, None),
            ]
        );
    }

    #[test]
    fn needing_subscribe_skips_in_flight() {
        let mut table = SubscriptionTable::default();
        let waiting = record("a");
        let resend = record("b");
        resend.set_state(SubscriptionState::Subscribing);
        let mut in_flight = record("c");
        in_flight.set_state(SubscriptionState::Subscribing);
        in_flight.pending = Some(CorrelationId::new(4));
        table.insert(SubscriptionId::new(0), waiting);
        table.insert(SubscriptionId::new(1), resend);
        table.insert(SubscriptionId::new(2), in_flight);

        assert_eq!(
            table.needing_subscribe(),
            vec![SubscriptionId::new(0), SubscriptionId::new(1)]
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(SubscriptionState::Subscribed.to_string(), "subscribed");
        assert!(SubscriptionState::UnsubscribingWhileSubscribing.is_unsubscribing());
        assert!(!SubscriptionState::Subscribing.is_unsubscribing());
    }
}
