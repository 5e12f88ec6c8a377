//! Error taxonomy for the server I/O engine.

use thiserror::Error;

/// Errors surfaced by the engine, the connection manager and transports.
///
/// `Clone` because a single settlement may be observed by several awaiters
/// of the same promise.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The transport failed before reaching the open state.
    #[error("failed connection: {0}")]
    Connection(String),

    /// Every attempt in a retry round failed.
    #[error("connection failed after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        /// Attempts made in the round.
        attempts: u32,
        /// Message of the final attempt's failure.
        last_error: String,
    },

    /// The caller withdrew interest before completion.
    #[error("canceled")]
    Canceled,

    /// Cancel on a request that already settled.
    #[error("already completed")]
    AlreadyCompleted,

    /// Cancel on something already being canceled or already canceled.
    #[error("already canceled")]
    AlreadyCanceled,

    /// Subscription value read before the first update arrived.
    #[error("no value received yet")]
    NoValueYet,

    /// The peer sent a frame whose kind (or notification type) is not part of the protocol.
    #[error("unknown message kind '{0}'")]
    UnknownFrameKind(String),

    /// The peer sent a frame that is structurally invalid.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer removed the subscription.
    #[error("subscription removed by server")]
    Removed,

    /// Handing a frame to the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be built from the caller's data.
    #[error("encode error: {0}")]
    Encode(String),
}

impl ClientError {
    /// Short classification string for logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::ConnectionExhausted { .. } => "connection_exhausted",
            Self::Canceled => "canceled",
            Self::AlreadyCompleted => "already_completed",
            Self::AlreadyCanceled => "already_canceled",
            Self::NoValueYet => "no_value_yet",
            Self::UnknownFrameKind(_) => "unknown_frame_kind",
            Self::Protocol(_) => "protocol",
            Self::Removed => "removed",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
        }
    }

    /// Whether the error came from the peer breaking the protocol.
    /// These are logged and dropped; the connection stays up.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::UnknownFrameKind(_) | Self::Protocol(_))
    }

    /// Whether the caller misused a handle (double cancel, early read).
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyCompleted | Self::AlreadyCanceled | Self::NoValueYet
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_display_names_attempts() {
        let err = ClientError::ConnectionExhausted {
            attempts: 3,
            last_error: "refused".into(),
        };
        assert_eq!(err.to_string(), "connection failed after 3 attempts: refused");
    }

    #[test]
    fn unknown_kind_display() {
        let err = ClientError::UnknownFrameKind("ping".into());
        assert_eq!(err.to_string(), "unknown message kind 'ping'");
    }

    #[test]
    fn protocol_violation_classification() {
        assert!(ClientError::UnknownFrameKind("x".into()).is_protocol_violation());
        assert!(ClientError::Protocol("bad".into()).is_protocol_violation());
        assert!(!ClientError::Canceled.is_protocol_violation());
    }

    #[test]
    fn misuse_classification() {
        assert!(ClientError::AlreadyCanceled.is_misuse());
        assert!(ClientError::AlreadyCompleted.is_misuse());
        assert!(ClientError::NoValueYet.is_misuse());
        assert!(!ClientError::Removed.is_misuse());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ClientError::Canceled.error_kind(), "canceled");
        assert_eq!(
            ClientError::ConnectionExhausted {
                attempts: 1,
                last_error: String::new()
            }
            .error_kind(),
            "connection_exhausted"
        );
        assert_eq!(ClientError::Transport("x".into()).error_kind(), "transport");
    }

    #[test]
    fn json_error_converts_to_encode() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: ClientError = json_err.into();
        assert!(matches!(err, ClientError::Encode(_)));
    }
}
