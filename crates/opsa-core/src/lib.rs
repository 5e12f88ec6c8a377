//! # opsa-core
//!
//! Shared vocabulary for the opsa server I/O engine:
//!
//! - **Branded IDs**: `CorrelationId`, `SubscriptionId`, `PeerSubscriptionId`
//!   as distinct newtypes so local and peer-assigned indices never mix
//! - **Frames**: the JSON wire protocol, decoded once into [`frames::InboundFrame`]
//! - **Errors**: the [`ClientError`] taxonomy via `thiserror`

#![deny(unsafe_code)]

pub mod errors;
pub mod frames;
pub mod ids;

pub use errors::{ClientError, Result};
pub use frames::{InboundFrame, NotificationKind, OutboundFrame, decode_frame};
pub use ids::{ConnectionId, CorrelationId, IdAllocator, PeerSubscriptionId, SubscriptionId};
