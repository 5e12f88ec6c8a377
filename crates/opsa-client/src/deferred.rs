//! A value settled from outside, awaited from inside.
//!
//! [`Deferred`] is the settling side, kept in the engine's tables.
//! [`Promise`] is the awaiting side, held by callers. The first settlement
//! wins; later ones are no-ops. Dropping an unsettled `Deferred` makes every
//! promise fail with [`ClientError::Canceled`].

use opsa_core::{ClientError, Result};
use tokio::sync::watch;

type Slot<T> = Option<Result<T>>;

/// Settling side of a one-shot value.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T: Clone + Send + Sync> Deferred<T> {
    /// Create an unsettled value.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// A new awaiting handle.
    pub fn promise(&self) -> Promise<T> {
        Promise {
            rx: self.tx.subscribe(),
        }
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn reject(&self, error: ClientError) -> bool {
        self.settle(Err(error))
    }

    /// Whether a resolve or reject already took effect.
    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }
}

impl<T: Clone + Send + Sync> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaiting side of a [`Deferred`]. Cheap to clone; every clone observes the
/// same settlement.
#[derive(Clone, Debug)]
pub struct Promise<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone + Send + Sync> Promise<T> {
    /// Wait for settlement.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        let slot = rx.wait_for(Option::is_some).await.map(|slot| (*slot).clone());
        match slot {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(_) => Err(ClientError::Canceled),
        }
    }

    /// The settlement, if it already happened.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.rx.borrow().clone()
    }
}
