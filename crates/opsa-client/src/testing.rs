//! In-memory transports and frame builders for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use opsa_core::{ClientError, Result};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::transport::{Connector, FrameSink, OpenTransport, TransportEvent};

/// Records every frame handed to it.
#[derive(Default)]
pub(crate) struct RecordingSink {
    frames: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames sent so far, parsed.
    pub(crate) fn frames(&self) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    /// Raw text of the frames sent so far.
    pub(crate) fn raw(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Drain and parse the frames sent so far.
    pub(crate) fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.frames.lock())
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl FrameSink for RecordingSink {
    fn send(&self, frame: String) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("sink refused frame".into()));
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

/// Connector whose attempts succeed or fail according to a script.
/// Attempts past the end of the script succeed.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<bool>>,
    opened: Mutex<Vec<(Arc<RecordingSink>, mpsc::Sender<TransportEvent>)>>,
    attempts: AtomicUsize,
    flaps: AtomicUsize,
}

impl ScriptedConnector {
    pub(crate) fn new(script: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Every attempt succeeds, but the first `flaps` transports close as
    /// soon as they open.
    pub(crate) fn flapping(flaps: usize) -> Arc<Self> {
        Arc::new(Self {
            flaps: AtomicUsize::new(flaps),
            ..Self::default()
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    /// Sink and event sender of the `n`th opened transport.
    pub(crate) fn transport(&self, n: usize) -> (Arc<RecordingSink>, mpsc::Sender<TransportEvent>) {
        let opened = self.opened.lock();
        let (sink, tx) = &opened[n];
        (Arc::clone(sink), tx.clone())
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<OpenTransport> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let succeed = self.script.lock().pop_front().unwrap_or(true);
        if !succeed {
            return Err(ClientError::Connection(format!("refused attempt {attempt}")));
        }
        let sink = RecordingSink::new();
        let (tx, rx) = mpsc::channel(64);
        let flap = self
            .flaps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flap {
            tx.try_send(TransportEvent::Closed {
                reason: Some("flap".into()),
            })
            .unwrap();
        }
        self.opened.lock().push((Arc::clone(&sink), tx));
        Ok(OpenTransport { sink, events: rx })
    }
}

pub(crate) fn response(index: u64, data: Value) -> String {
    json!({"kind": "response", "index": index, "data": data}).to_string()
}

pub(crate) fn ack(index: u64, peer: u64) -> String {
    response(index, json!({"index": peer}))
}

pub(crate) fn update(peer: u64, data: Value) -> String {
    json!({"kind": "notification", "index": peer, "data": {"type": "update", "data": data}})
        .to_string()
}

pub(crate) fn remove(peer: u64) -> String {
    json!({"kind": "notification", "index": peer, "data": {"type": "remove"}}).to_string()
}
