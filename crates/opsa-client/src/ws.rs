//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each open socket is split into a writer task fed by a bounded queue and a
//! reader task that turns socket messages into [`TransportEvent`]s. Both
//! tasks share a cancellation token; whichever side stops first stops the
//! other.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use opsa_core::{ClientError, ConnectionId, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::transport::{Connector, FrameSink, OpenTransport, TransportEvent};

/// Opens WebSocket transports to one URL.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
    send_queue: usize,
}

impl WsConnector {
    /// Connector for `url` with a queue of `send_queue` outgoing frames.
    pub fn new(url: impl Into<String>, send_queue: usize) -> Self {
        Self {
            url: url.into(),
            send_queue: send_queue.max(1),
        }
    }

    /// Connector for the URL and queue bound in `config`.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.url.clone(), config.send_queue)
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<OpenTransport> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connection(format!("{}: {e}", self.url)))?;
        let connection_id = ConnectionId::new();
        debug!(connection_id = %connection_id, url = %self.url, "websocket open");

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(self.send_queue);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(self.send_queue);
        let closed = CancellationToken::new();

        // Writer task: forward queued frames to the socket
        let writer_closed = closed.clone();
        let writer_id = connection_id.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_closed.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                                debug!(connection_id = %writer_id, error = %e, "websocket write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = ws_tx.close().await;
            writer_closed.cancel();
            trace!(connection_id = %writer_id, "writer stopped");
        }));

        // Reader task: turn socket messages into transport events
        let reader_closed = closed.clone();
        drop(tokio::spawn(async move {
            let last = loop {
                tokio::select! {
                    () = reader_closed.cancelled() => {
                        break TransportEvent::Closed { reason: Some("closed locally".into()) };
                    }
                    msg = ws_rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let event = TransportEvent::Message(text.as_str().to_owned());
                            if event_tx.send(event).await.is_err() {
                                reader_closed.cancel();
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_owned())
                                .filter(|r| !r.is_empty());
                            break TransportEvent::Closed { reason };
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            debug!(connection_id = %connection_id, len = bytes.len(), "ignoring binary frame");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                        None => break TransportEvent::Closed { reason: None },
                    },
                }
            };
            reader_closed.cancel();
            let _ = event_tx.send(last).await;
            trace!(connection_id = %connection_id, "reader stopped");
        }));

        Ok(OpenTransport {
            sink: Arc::new(WsSink { tx, closed }),
            events: event_rx,
        })
    }
}

/// Outgoing side of a WebSocket transport.
///
/// A full queue means the socket is not draining; the transport is closed so
/// the connection manager reconnects and replays.
pub struct WsSink {
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl FrameSink for WsSink {
    fn send(&self, frame: String) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Transport("socket closed".into()));
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                warn!(frame_len = frame.len(), "send queue full, closing socket");
                self.closed.cancel();
                Err(ClientError::Transport("send queue full".into()))
            }
            Err(TrySendError::Closed(_)) => Err(ClientError::Transport("socket closed".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn sink_reports_full_queue_and_closes() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = WsSink {
            tx,
            closed: CancellationToken::new(),
        };
        assert!(sink.send("a".into()).is_ok());
        assert_matches!(sink.send("b".into()), Err(ClientError::Transport(msg)) if msg.contains("full"));
        assert_matches!(sink.send("c".into()), Err(ClientError::Transport(msg)) if msg.contains("closed"));
    }

    #[test]
    fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sink = WsSink {
            tx,
            closed: CancellationToken::new(),
        };
        assert_matches!(sink.send("a".into()), Err(ClientError::Transport(_)));
    }

    #[test]
    fn zero_queue_is_clamped() {
        let connector = WsConnector::new("ws://127.0.0.1:1/ws", 0);
        assert_eq!(connector.send_queue, 1);
        assert_eq!(connector.url(), "ws://127.0.0.1:1/ws");
    }

    #[tokio::test]
    async fn unreachable_peer_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WsConnector::new(format!("ws://127.0.0.1:{port}/ws"), 8);
        assert_matches!(connector.connect().await, Err(ClientError::Connection(_)));
    }
}
