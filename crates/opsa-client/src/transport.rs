//! Transport seam between the connection manager and a concrete socket.
//!
//! A [`Connector`] opens one transport per call. The open transport is split
//! into a [`FrameSink`] (handed to [`ServerIo`](crate::ServerIo)) and a stream
//! of [`TransportEvent`]s (consumed by the connection manager's pump).

use std::sync::Arc;

use async_trait::async_trait;
use opsa_core::Result;
use tokio::sync::mpsc;

/// Outgoing side of a transport.
///
/// `send` must not block: it is called while the engine lock is held.
pub trait FrameSink: Send + Sync {
    /// Queue one text frame for delivery.
    fn send(&self, frame: String) -> Result<()>;
}

/// Something that happened on an open transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the peer.
    Message(String),
    /// The transport closed. No further events follow.
    Closed {
        /// Close reason, if the peer gave one.
        reason: Option<String>,
    },
    /// The transport failed. No further events follow.
    Error(String),
}

/// A transport that reached the open state.
pub struct OpenTransport {
    /// Outgoing frames.
    pub sink: Arc<dyn FrameSink>,
    /// Incoming frames and lifecycle events.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for OpenTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenTransport")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one attempt. Fails with [`ClientError::Connection`](opsa_core::ClientError::Connection)
    /// if the transport errors before reaching the open state.
    async fn connect(&self) -> Result<OpenTransport>;
}
