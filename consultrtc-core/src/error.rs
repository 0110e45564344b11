//! Error types for ConsultRTC

use std::time::Duration;
use thiserror::Error;

/// Main error type for ConsultRTC operations
#[derive(Error, Debug)]
pub enum ConsultRtcError {
    /// Channel is not open, send rejected
    #[error("Channel {channel} not ready (state: {state})")]
    ChannelNotReady {
        /// Channel name
        channel: String,
        /// State the channel was in when the send was attempted
        state: String,
    },

    /// Connecting to the relay failed
    #[error("Failed to connect {channel} to {url}: {reason}")]
    ChannelConnect {
        /// Channel name
        channel: String,
        /// Relay URL
        url: String,
        /// Reason for connection failure
        reason: String,
    },

    /// Reconnect attempts exhausted, channel is permanently disconnected
    #[error("Channel {channel} disconnected after {attempts} reconnect attempts")]
    ChannelExhausted {
        /// Channel name
        channel: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Channel was closed by its owner
    #[error("Channel {channel} is closed")]
    ChannelClosed {
        /// Channel name
        channel: String,
    },

    /// SDP or ICE application failure
    #[error("Negotiation failed: {reason}")]
    Negotiation {
        /// Reason for failure
        reason: String,
    },

    /// A second offer/answer exchange was attempted
    #[error("Renegotiation is not supported (attempted: {operation})")]
    RenegotiationUnsupported {
        /// Operation that would have renegotiated
        operation: String,
    },

    /// Peer connection is already closed
    #[error("Peer connection closed")]
    PeerClosed,

    /// Local device acquisition failed
    #[error("Media unavailable: {reason}")]
    MediaUnavailable {
        /// Reason for failure
        reason: String,
    },

    /// Chunk or final-flush upload failure
    #[error("Upload failed for chunk {chunk_index:?} (final: {is_final}): {reason}")]
    Upload {
        /// Chunk index, `None` for requests not tied to a chunk
        chunk_index: Option<u64>,
        /// Whether this was the final upload of the job
        is_final: bool,
        /// Reason for failure
        reason: String,
    },

    /// Call status could not be reported to the backend
    #[error("Status update for {user_id} failed: {reason}")]
    StatusUpdate {
        /// User whose status was being updated
        user_id: String,
        /// Reason for failure
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// A non-terminal session already exists for this pair
    #[error("Call from {caller_id} to {callee_id} is already active")]
    SessionAlreadyActive {
        /// Caller ID
        caller_id: String,
        /// Callee ID
        callee_id: String,
    },

    /// Operation timed out error
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration {
        /// Configuration field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: std::net::SocketAddr,
        /// Underlying error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connect/reconnect and send failures on a duplex channel
    Channel,
    /// SDP/ICE application failures
    Negotiation,
    /// Local device acquisition failures
    Media,
    /// Recording upload failures
    Upload,
    /// Call lifecycle errors
    Session,
    /// Configuration and parameter errors
    Configuration,
    /// Malformed wire data and server errors
    Protocol,
}

impl ConsultRtcError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            ConsultRtcError::ChannelNotReady { .. } => "CHANNEL_NOT_READY".to_string(),
            ConsultRtcError::ChannelConnect { .. } => "CHANNEL_CONNECT_FAILED".to_string(),
            ConsultRtcError::ChannelExhausted { .. } => "CHANNEL_EXHAUSTED".to_string(),
            ConsultRtcError::ChannelClosed { .. } => "CHANNEL_CLOSED".to_string(),
            ConsultRtcError::Negotiation { .. } => "NEGOTIATION_FAILED".to_string(),
            ConsultRtcError::RenegotiationUnsupported { .. } => {
                "RENEGOTIATION_UNSUPPORTED".to_string()
            }
            ConsultRtcError::PeerClosed => "PEER_CLOSED".to_string(),
            ConsultRtcError::MediaUnavailable { .. } => "MEDIA_UNAVAILABLE".to_string(),
            ConsultRtcError::Upload { .. } => "UPLOAD_FAILED".to_string(),
            ConsultRtcError::StatusUpdate { .. } => "STATUS_UPDATE_FAILED".to_string(),
            ConsultRtcError::InvalidState { .. } => "INVALID_STATE".to_string(),
            ConsultRtcError::SessionAlreadyActive { .. } => "SESSION_ALREADY_ACTIVE".to_string(),
            ConsultRtcError::Timeout { .. } => "TIMEOUT".to_string(),
            ConsultRtcError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            ConsultRtcError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION".to_string(),
            ConsultRtcError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            ConsultRtcError::ServerStartFailed { .. } => "SERVER_START_FAILED".to_string(),
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConsultRtcError::ChannelNotReady { .. }
            | ConsultRtcError::ChannelConnect { .. }
            | ConsultRtcError::ChannelExhausted { .. }
            | ConsultRtcError::ChannelClosed { .. } => ErrorCategory::Channel,
            ConsultRtcError::Negotiation { .. }
            | ConsultRtcError::RenegotiationUnsupported { .. }
            | ConsultRtcError::PeerClosed => ErrorCategory::Negotiation,
            ConsultRtcError::MediaUnavailable { .. } => ErrorCategory::Media,
            ConsultRtcError::Upload { .. } => ErrorCategory::Upload,
            ConsultRtcError::StatusUpdate { .. }
            | ConsultRtcError::InvalidState { .. }
            | ConsultRtcError::SessionAlreadyActive { .. }
            | ConsultRtcError::Timeout { .. } => ErrorCategory::Session,
            ConsultRtcError::MissingConfiguration { .. }
            | ConsultRtcError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            ConsultRtcError::InvalidMessage { .. } | ConsultRtcError::ServerStartFailed { .. } => {
                ErrorCategory::Protocol
            }
        }
    }

    /// Transient errors are retried and logged, never surfaced to the user
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsultRtcError::ChannelNotReady { .. }
                | ConsultRtcError::ChannelConnect { .. }
                | ConsultRtcError::Upload { .. }
                | ConsultRtcError::StatusUpdate { .. }
                | ConsultRtcError::InvalidMessage { .. }
        )
    }
}

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, ConsultRtcError>;
