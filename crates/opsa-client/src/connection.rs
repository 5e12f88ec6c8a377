//! Connection manager.
//!
//! Owns the single active transport. Each successful open attaches the
//! transport's sink to [`ServerIo`] and spawns a pump task that feeds inbound
//! frames to the engine. When the transport closes the pump detaches the
//! engine, reports the loss, and (with `auto_reconnect`) starts a reconnect
//! loop that runs until it succeeds or the manager shuts down.

use std::sync::Arc;

use opsa_core::{ClientError, Result};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::server_io::ServerIo;
use crate::transport::{Connector, OpenTransport, TransportEvent};

const EVENT_CAPACITY: usize = 32;

/// Connection lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport opened and pending work was replayed.
    Connected,
    /// The transport closed or failed.
    Disconnected {
        /// Close reason or error text, if any.
        reason: Option<String>,
    },
    /// A reconnect round is starting.
    Reconnecting {
        /// 1-based round number since the disconnect.
        attempt: u32,
    },
    /// Every attempt of a reconnect round failed; another round follows
    /// after the retry delay.
    RetryExhausted {
        /// Attempts made in the round.
        attempts: u32,
    },
}

type DisconnectHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Which transport is current. Generation bumps, attach, detach and the
/// supervisor flag all change together under one lock.
#[derive(Default)]
struct Link {
    generation: u64,
    reconnecting: bool,
    pump: Option<JoinHandle<()>>,
}

struct ManagerInner {
    io: ServerIo,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    events: broadcast::Sender<ConnectionEvent>,
    on_disconnected: Mutex<Option<DisconnectHook>>,
    link: Mutex<Link>,
    shutdown: CancellationToken,
}

/// Connects [`ServerIo`] to the peer and keeps it connected.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager. Nothing happens until [`connect`](Self::connect) or
    /// [`connect_with_retry`](Self::connect_with_retry).
    pub fn new(io: ServerIo, connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                io,
                connector,
                config,
                events,
                on_disconnected: Mutex::new(None),
                link: Mutex::new(Link::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The engine this manager drives.
    pub fn io(&self) -> &ServerIo {
        &self.inner.io
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Receive lifecycle notifications from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Install a hook called on every transport loss, before any reconnect.
    /// Replaces a previous hook.
    pub fn on_disconnected(&self, hook: impl Fn(Option<&str>) + Send + Sync + 'static) {
        *self.inner.on_disconnected.lock() = Some(Arc::new(hook));
    }

    /// Whether a transport is currently attached.
    pub fn is_connected(&self) -> bool {
        self.inner.io.is_attached()
    }

    /// Make one connection attempt. Fails with [`ClientError::Connection`]
    /// if the transport errors before opening.
    pub async fn connect(&self) -> Result<()> {
        self.open(false).await
    }

    /// Try [`connect`](Self::connect) up to `max_attempts` times with the
    /// configured fixed delay in between. Fails with
    /// [`ClientError::ConnectionExhausted`] after the last failure.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<()> {
        self.open_with_retry(max_attempts, false).await
    }

    /// Stop reconnecting, stop the pump and detach the engine. Pending
    /// requests stay pending.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut link = self.inner.link.lock();
        if let Some(pump) = link.pump.take() {
            pump.abort();
        }
        self.inner.io.detach();
        drop(link);
        info!("connection manager shut down");
    }

    /// One attempt. `supervised` attempts belong to the reconnect loop and
    /// hand the supervisor role back in the same step that installs the
    /// transport, so a close of that transport can start a new loop.
    async fn open(&self, supervised: bool) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClientError::Connection("connection manager is shut down".into()));
        }
        let OpenTransport { sink, events } = self.inner.connector.connect().await?;

        let mut link = self.inner.link.lock();
        if self.inner.shutdown.is_cancelled() {
            return Err(ClientError::Connection("connection manager is shut down".into()));
        }
        link.generation += 1;
        let generation = link.generation;
        if supervised {
            link.reconnecting = false;
        }
        self.inner.io.attach(sink);
        info!(generation, "connected");
        let _ = self.inner.events.send(ConnectionEvent::Connected);

        let manager = self.clone();
        let pump = tokio::spawn(async move { manager.pump(generation, events).await });
        if let Some(previous) = link.pump.replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn open_with_retry(&self, max_attempts: u32, supervised: bool) -> Result<()> {
        let max_attempts = max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < max_attempts {
            attempts += 1;
            match self.open(supervised).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    if attempts < max_attempts {
                        warn!(attempt = attempts, max_attempts, error = %e, "connection attempt failed, retrying");
                        if !self.pause().await {
                            break;
                        }
                    }
                }
            }
        }
        Err(ClientError::ConnectionExhausted {
            attempts,
            last_error,
        })
    }

    /// Sleep for the retry delay. Returns `false` if shutdown cut it short.
    async fn pause(&self) -> bool {
        tokio::select! {
            () = self.inner.shutdown.cancelled() => false,
            () = tokio::time::sleep(self.inner.config.retry_delay) => true,
        }
    }

    async fn pump(self, generation: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let reason = loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.inner.io.handle_message(&text),
                    Some(TransportEvent::Closed { reason }) => break reason,
                    Some(TransportEvent::Error(e)) => {
                        warn!(generation, error = %e, "transport error");
                        break Some(e);
                    }
                    None => break None,
                },
            }
        };
        self.handle_close(generation, reason);
    }

    fn handle_close(&self, generation: u64, reason: Option<String>) {
        let start_supervisor = {
            let mut link = self.inner.link.lock();
            if link.generation != generation {
                debug!(generation, "stale transport closed");
                return;
            }
            self.inner.io.detach();
            let start = self.inner.config.auto_reconnect
                && !self.inner.shutdown.is_cancelled()
                && !link.reconnecting;
            if start {
                link.reconnecting = true;
            }
            start
        };

        warn!(generation, reason = reason.as_deref().unwrap_or("none"), "disconnected");
        let _ = self.inner.events.send(ConnectionEvent::Disconnected {
            reason: reason.clone(),
        });

        let hook = self.inner.on_disconnected.lock().clone();
        if let Some(hook) = hook {
            hook(reason.as_deref());
        }

        if start_supervisor {
            let manager = self.clone();
            drop(tokio::spawn(async move { manager.reconnect_loop().await }));
        }
    }

    /// Give up the supervisor role if something else already reconnected.
    fn yield_if_connected(&self) -> bool {
        let mut link = self.inner.link.lock();
        if self.inner.io.is_attached() {
            link.reconnecting = false;
            return true;
        }
        false
    }

    async fn reconnect_loop(&self) {
        let mut round = 0_u32;
        while !self.inner.shutdown.is_cancelled() {
            if self.yield_if_connected() {
                debug!("transport already replaced, reconnect loop exits");
                return;
            }
            round += 1;
            info!(round, "reconnecting");
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::Reconnecting { attempt: round });
            match self.open_with_retry(self.inner.config.max_attempts, true).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(round, error = %e, "reconnect round failed");
                    if let ClientError::ConnectionExhausted { attempts, .. } = e {
                        let _ = self
                            .inner
                            .events
                            .send(ConnectionEvent::RetryExhausted { attempts });
                    }
                    if !self.pause().await {
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
