//! Subscription handlers.
//!
//! A handler receives the two peer-initiated events of a subscription:
//! a new value, and removal. Caller cancellation never reaches a handler.
//! Handlers run after the engine lock is released, so they may call back
//! into [`ServerIo`](crate::ServerIo).

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Receiver of peer-initiated subscription events.
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// A new value arrived.
    fn on_update(&self, value: &Value);

    /// The peer removed the subscription. It is already `Unsubscribed`.
    fn on_remove(&self) {
        warn!("subscription removal was ignored");
    }
}

/// Adapter for a closure that only cares about updates.
pub struct FnHandler<F>(pub F);

impl<F> SubscriptionHandler for FnHandler<F>
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    fn on_update(&self, value: &Value) {
        (self.0)(value);
    }
}

type UpdateFn = Box<dyn Fn(&Value) + Send + Sync>;
type RemoveFn = Box<dyn Fn() + Send + Sync>;

/// A pair of closures, one per event.
pub struct Handlers {
    update: UpdateFn,
    remove: RemoveFn,
}

impl Handlers {
    /// Build from an update closure and a remove closure.
    pub fn new(
        update: impl Fn(&Value) + Send + Sync + 'static,
        remove: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            update: Box::new(update),
            remove: Box::new(remove),
        }
    }
}

impl SubscriptionHandler for Handlers {
    fn on_update(&self, value: &Value) {
        (self.update)(value);
    }

    fn on_remove(&self) {
        (self.remove)();
    }
}

/// Event delivered by a [`ChannelHandler`].
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// A new value.
    Update(Value),
    /// Peer-initiated removal; no further events follow.
    Removed,
}

/// Forwards events into an unbounded channel. Dropping the receiver turns the
/// handler into a no-op.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SubscriptionHandler for ChannelHandler {
    fn on_update(&self, value: &Value) {
        let _ = self.tx.send(SubscriptionEvent::Update(value.clone()));
    }

    fn on_remove(&self) {
        let _ = self.tx.send(SubscriptionEvent::Removed);
    }
}

/// Ignores both events. For subscriptions read only through
/// [`SubscriptionHandle::value`](crate::SubscriptionHandle::value) and
/// [`SubscriptionHandle::wait`](crate::SubscriptionHandle::wait).
pub struct NoopHandler;

impl SubscriptionHandler for NoopHandler {
    fn on_update(&self, _value: &Value) {}

    fn on_remove(&self) {}
}
