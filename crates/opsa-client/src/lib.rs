//! # opsa-client
//!
//! The server I/O engine: request/response RPCs and long-lived push
//! subscriptions multiplexed over one socket, surviving socket loss.
//!
//! - [`ServerIo`]: protocol state (request and subscription tables, replay on
//!   attach, reconciliation on detach). Knows nothing about sockets beyond a
//!   [`FrameSink`].
//! - [`ConnectionManager`]: owns the transport, connects with retry, pumps
//!   inbound frames into the engine and reconnects on close.
//! - [`WsConnector`]: the `tokio-tungstenite` transport.
//!
//! ```text
//! caller ──request/subscribe──▶ ServerIo ──frames──▶ FrameSink ──▶ socket
//!                                  ▲                                  │
//!                                  └──handle_message── pump ◀─────────┘
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod deferred;
pub mod handler;
pub mod requests;
pub mod server_io;
pub mod subscriptions;
pub mod transport;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ConnectionConfig;
pub use connection::{ConnectionEvent, ConnectionManager};
pub use deferred::{Deferred, Promise};
pub use handler::{ChannelHandler, FnHandler, Handlers, NoopHandler, SubscriptionEvent, SubscriptionHandler};
pub use opsa_core::{ClientError, CorrelationId, PeerSubscriptionId, Result, SubscriptionId};
pub use requests::{PendingRequest, RequestHandle, RequestState};
pub use server_io::ServerIo;
pub use subscriptions::{ActiveSubscription, SubscriptionHandle, SubscriptionState};
pub use transport::{Connector, FrameSink, OpenTransport, TransportEvent};
pub use ws::{WsConnector, WsSink};
