//! # ConsultRTC Core
//!
//! Shared foundations for ConsultRTC: the error taxonomy, the reconnect
//! discipline used by every duplex channel, and the SDP/ICE payload types
//! exchanged during negotiation.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod reconnect;
pub mod sdp;

// Re-export main types
pub use error::{ConsultRtcError, ErrorCategory, Result};
pub use reconnect::{Backoff, ChannelState, ReconnectPolicy};
pub use sdp::{IceCandidate, SdpType, SessionDescription};
