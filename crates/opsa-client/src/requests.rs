//! Request tracker.
//!
//! Every outstanding RPC has one record keyed by its correlation index.
//! A record is removed the moment its outcome is known, so "returned" and
//! "canceled" are both represented by absence.
//!
//! ```text
//! WaitingForSocket ──attach──▶ Sent ──response──▶ (returned)
//!        ▲   │                  │ │
//!        │   └──cancel──▶ (canceled)  └──cancel──▶ Canceling ──response/detach──▶ (canceled)
//!        └────detach────────────┘
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use opsa_core::{ClientError, CorrelationId, Result, SubscriptionId};
use serde_json::Value;

use crate::deferred::{Deferred, Promise};
use crate::server_io::ServerIo;

/// Where a live request record is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Not on the current transport; sent on the next attach.
    WaitingForSocket,
    /// Frame handed to the current transport; awaiting the response.
    Sent,
    /// Caller canceled after sending; awaiting the peer's answer or a detach.
    Canceling,
}

/// Who is waiting on a request record.
pub(crate) enum RequestOrigin {
    /// A caller of [`ServerIo::request`].
    Caller {
        response: Deferred<Value>,
        cancel: Option<Deferred<Option<Value>>>,
    },
    /// The subscribe frame of a subscription.
    Subscribe(SubscriptionId),
    /// The unsubscribe frame of a subscription.
    Unsubscribe(SubscriptionId),
}

pub(crate) struct RequestRecord {
    pub(crate) method: String,
    pub(crate) frame: String,
    pub(crate) state: RequestState,
    pub(crate) origin: RequestOrigin,
}

/// Counts from reconciling the table with a lost transport.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DetachOutcome {
    pub(crate) requeued: usize,
    pub(crate) canceled: usize,
    pub(crate) dropped_internal: usize,
}

/// Outcome of [`RequestTable::cancel`].
#[derive(Debug)]
pub(crate) enum CancelOutcome {
    /// Nothing was on the wire; the request is gone.
    Immediate,
    /// The peer may still answer; the promise carries that answer.
    Pending(Promise<Option<Value>>),
}

#[derive(Default)]
pub(crate) struct RequestTable {
    records: BTreeMap<CorrelationId, RequestRecord>,
}

impl RequestTable {
    pub(crate) fn insert(&mut self, index: CorrelationId, record: RequestRecord) {
        let _ = self.records.insert(index, record);
    }

    pub(crate) fn remove(&mut self, index: CorrelationId) -> Option<RequestRecord> {
        self.records.remove(&index)
    }

    pub(crate) fn get_mut(&mut self, index: CorrelationId) -> Option<&mut RequestRecord> {
        self.records.get_mut(&index)
    }

    /// Caller records not yet on the current transport, lowest index first.
    pub(crate) fn waiting_mut(
        &mut self,
    ) -> impl Iterator<Item = (CorrelationId, &mut RequestRecord)> {
        self.records
            .iter_mut()
            .filter(|(_, r)| r.state == RequestState::WaitingForSocket)
            .map(|(index, r)| (*index, r))
    }

    pub(crate) fn cancel(&mut self, index: CorrelationId) -> Result<CancelOutcome> {
        let Some(record) = self.records.get_mut(&index) else {
            return Err(ClientError::AlreadyCompleted);
        };
        let RequestOrigin::Caller { response, cancel } = &mut record.origin else {
            return Err(ClientError::AlreadyCompleted);
        };
        match record.state {
            RequestState::WaitingForSocket => {
                let _ = response.reject(ClientError::Canceled);
                let _ = self.records.remove(&index);
                Ok(CancelOutcome::Immediate)
            }
            RequestState::Sent => {
                let _ = response.reject(ClientError::Canceled);
                let deferred = Deferred::new();
                let promise = deferred.promise();
                *cancel = Some(deferred);
                record.state = RequestState::Canceling;
                Ok(CancelOutcome::Pending(promise))
            }
            RequestState::Canceling => Err(ClientError::AlreadyCanceled),
        }
    }

    /// Reconcile with a lost transport: sent requests go back to waiting,
    /// canceling ones finish, and subscribe/unsubscribe frames are dropped
    /// because they belonged to that transport.
    pub(crate) fn detach(&mut self) -> DetachOutcome {
        let mut outcome = DetachOutcome::default();
        self.records.retain(|_, record| match &record.origin {
            RequestOrigin::Subscribe(_) | RequestOrigin::Unsubscribe(_) => {
                outcome.dropped_internal += 1;
                false
            }
            RequestOrigin::Caller { cancel, .. } => match record.state {
                RequestState::WaitingForSocket => true,
                RequestState::Sent => {
                    record.state = RequestState::WaitingForSocket;
                    outcome.requeued += 1;
                    true
                }
                RequestState::Canceling => {
                    if let Some(cancel) = cancel {
                        let _ = cancel.resolve(None);
                    }
                    outcome.canceled += 1;
                    false
                }
            },
        });
        outcome
    }

    pub(crate) fn summaries(&self) -> Vec<PendingRequest> {
        self.records
            .iter()
            .filter(|(_, r)| matches!(r.origin, RequestOrigin::Caller { .. }))
            .map(|(index, r)| PendingRequest {
                index: *index,
                method: r.method.clone(),
                state: r.state,
            })
            .collect()
    }
}

/// Snapshot of one outstanding caller request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    /// Correlation index.
    pub index: CorrelationId,
    /// Method name.
    pub method: String,
    /// Current state.
    pub state: RequestState,
}

/// Caller's handle on one RPC.
///
/// Dropping the handle does not cancel the request.
#[derive(Clone)]
pub struct RequestHandle {
    io: ServerIo,
    index: CorrelationId,
    response: Promise<Value>,
}

impl RequestHandle {
    pub(crate) fn new(io: ServerIo, index: CorrelationId, response: Promise<Value>) -> Self {
        Self {
            io,
            index,
            response,
        }
    }

    /// Correlation index of this request.
    pub fn index(&self) -> CorrelationId {
        self.index
    }

    /// Wait for the response payload. Fails with [`ClientError::Canceled`]
    /// once the request is canceled.
    pub async fn response(&self) -> Result<Value> {
        self.response.wait().await
    }

    /// The outcome, if already settled.
    pub fn try_response(&self) -> Option<Result<Value>> {
        self.response.try_get()
    }

    /// Like [`response`](Self::response), but cancel the request and fail
    /// with [`ClientError::Canceled`] if nothing arrives within `limit`.
    pub async fn response_timeout(&self, limit: Duration) -> Result<Value> {
        if let Ok(outcome) = tokio::time::timeout(limit, self.response()).await {
            return outcome;
        }
        tracing::debug!(index = %self.index, ?limit, "request timed out, canceling");
        drop(self.cancel());
        Err(ClientError::Canceled)
    }

    /// Withdraw interest.
    ///
    /// The transition happens immediately: [`response`](Self::response) fails
    /// with [`ClientError::Canceled`] before this returns. The returned
    /// future resolves to the peer's late answer (`Some`) or to `None` if
    /// the request never reached the peer or its transport was lost.
    pub fn cancel(&self) -> impl Future<Output = Result<Option<Value>>> + Send + 'static {
        let outcome = self.io.cancel_request(self.index);
        async move {
            match outcome? {
                CancelOutcome::Immediate => Ok(None),
                CancelOutcome::Pending(promise) => promise.wait().await,
            }
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
