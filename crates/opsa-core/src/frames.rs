//! JSON wire frames.
//!
//! Outbound traffic is always a `request` frame. Inbound traffic is decoded
//! once, at the transport boundary, into [`InboundFrame`]; anything that is
//! not a `response` or `notification` becomes [`ClientError::UnknownFrameKind`].
//!
//! ```json
//! {"kind":"request","index":3,"method":"subscribe","data":{"name":"listfiles"}}
//! {"kind":"response","index":3,"data":{"index":0}}
//! {"kind":"notification","index":0,"data":{"type":"update","data":{"files":{}}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ClientError, Result};
use crate::ids::{CorrelationId, PeerSubscriptionId};

/// Method name of the subscribe request.
pub const SUBSCRIBE_METHOD: &str = "subscribe";
/// Method name of the unsubscribe request.
pub const UNSUBSCRIBE_METHOD: &str = "unsubscribe";

/// A frame sent to the peer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// An RPC call; the peer answers with a `response` carrying the same index.
    Request {
        /// Correlation index.
        index: CorrelationId,
        /// Method name.
        method: String,
        /// Method arguments.
        data: Value,
    },
}

impl OutboundFrame {
    /// Build a request frame.
    pub fn request(index: CorrelationId, method: impl Into<String>, data: Value) -> Self {
        Self::Request {
            index,
            method: method.into(),
            data,
        }
    }

    /// Serialize to the text form sent over the socket.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What a notification says about its subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum NotificationKind {
    /// A new value for the subscription.
    Update(Value),
    /// The peer dropped the subscription.
    Remove,
}

/// A decoded frame received from the peer.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Answer to the request with the same correlation index.
    Response {
        /// Correlation index of the originating request.
        index: CorrelationId,
        /// Response payload.
        data: Value,
    },
    /// Push message for a peer-assigned subscription index.
    Notification {
        /// Peer-assigned subscription index.
        index: PeerSubscriptionId,
        /// Update or removal.
        kind: NotificationKind,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    kind: String,
    #[serde(default)]
    index: Option<u64>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text message from the peer.
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| ClientError::Protocol(format!("malformed frame: {e}")))?;

    match raw.kind.as_str() {
        "response" => {
            let index = raw
                .index
                .ok_or_else(|| ClientError::Protocol("response frame without index".into()))?;
            Ok(InboundFrame::Response {
                index: CorrelationId::new(index),
                data: raw.data,
            })
        }
        "notification" => {
            let index = raw.index.ok_or_else(|| {
                ClientError::Protocol("notification frame without index".into())
            })?;
            let body: RawNotification = serde_json::from_value(raw.data)
                .map_err(|e| ClientError::Protocol(format!("malformed notification: {e}")))?;
            let kind = match body.kind.as_str() {
                "update" => NotificationKind::Update(body.data),
                "remove" => NotificationKind::Remove,
                other => return Err(ClientError::UnknownFrameKind(format!("notification/{other}"))),
            };
            Ok(InboundFrame::Notification {
                index: PeerSubscriptionId::new(index),
                kind,
            })
        }
        other => Err(ClientError::UnknownFrameKind(other.to_owned())),
    }
}

/// Data of a subscribe request: `{"name": topic, ...filter}`.
///
/// A `null` filter means no filter. The topic always wins over a `name` key
/// in the filter.
pub fn subscribe_data(topic: &str, filter: &Value) -> Result<Value> {
    let mut data = match filter {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => {
            return Err(ClientError::Encode(
                "subscription filter must be a JSON object".into(),
            ));
        }
    };
    let _ = data.insert("name".to_owned(), Value::String(topic.to_owned()));
    Ok(Value::Object(data))
}

/// Data of an unsubscribe request.
pub fn unsubscribe_data(index: PeerSubscriptionId) -> Value {
    serde_json::json!({ "index": index })
}

/// Extract the peer-assigned index from a subscribe response.
pub fn parse_subscribe_ack(data: &Value) -> Result<PeerSubscriptionId> {
    data.get("index")
        .and_then(Value::as_u64)
        .map(PeerSubscriptionId::new)
        .ok_or_else(|| ClientError::Protocol("subscribe response without a subscription index".into()))
}
