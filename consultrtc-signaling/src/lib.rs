//! # ConsultRTC Signaling
//!
//! Call-control signaling and notification delivery for ConsultRTC.
//! Both run over reconnecting duplex channels that share one backoff
//! discipline; the relay server routes frames between users.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod notification;
pub mod protocol;
pub mod server;
pub mod signaling;

// Re-export main types
pub use channel::{
    ChannelEvent, Connection, Connector, DuplexChannel, TransportEvent, WebSocketConnector,
};
pub use notification::{Notification, NotificationBus, NotificationEvent, NotificationStore};
pub use protocol::{
    MessageKind, NotificationFrame, NotificationPayload, NotificationType, SignalingMessage,
};
pub use server::{RelayHandle, RelayServer, Route};
pub use signaling::{HandlerId, SignalingChannel};
