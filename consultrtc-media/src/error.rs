//! Media error types and handling
//!
//! Device, recorder and upload failures raised inside the media crate.
//! They convert into [`ConsultRtcError`] at the crate boundary.

use consultrtc_core::ConsultRtcError;
use thiserror::Error;

/// Main error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// HTTP client could not be built or a request part was invalid
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        /// Underlying error
        source: reqwest::Error,
    },

    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Camera or microphone could not be opened
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// Device identifier
        device_id: String,
    },

    /// Recorder failed to start or stop
    #[error("Recorder error: {reason}")]
    Recorder {
        /// Failure reason
        reason: String,
    },

    /// Upload rejected or not delivered
    #[error("Upload failed for chunk {index} (final: {is_final}): {reason}")]
    Upload {
        /// Chunk index
        index: u64,
        /// Whether this was the final upload
        is_final: bool,
        /// Failure reason
        reason: String,
    },

    /// Operation did not finish in time
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Duration after which timeout occurred
        duration: std::time::Duration,
    },

    /// Operation not valid for the current job state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Whether retrying the operation can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MediaError::Http { .. } | MediaError::Upload { .. } | MediaError::Timeout { .. }
        )
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::Http { .. } | MediaError::Upload { .. } => ErrorCategory::Network,
            MediaError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            MediaError::DeviceNotFound { .. } => ErrorCategory::Device,
            MediaError::Recorder { .. } | MediaError::Timeout { .. } => ErrorCategory::Recording,
            MediaError::InvalidState { .. } => ErrorCategory::State,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration and parameter errors
    Configuration,
    /// Camera and microphone errors
    Device,
    /// Recorder errors
    Recording,
    /// Job state errors
    State,
    /// Upload and HTTP errors
    Network,
}

impl From<MediaError> for ConsultRtcError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::Upload {
                index,
                is_final,
                reason,
            } => ConsultRtcError::Upload {
                chunk_index: Some(index),
                is_final,
                reason,
            },
            MediaError::Http { source } => ConsultRtcError::Upload {
                chunk_index: None,
                is_final: false,
                reason: source.to_string(),
            },
            MediaError::InvalidConfiguration { message } => ConsultRtcError::InvalidConfiguration {
                field: "media".to_string(),
                reason: message,
            },
            other => ConsultRtcError::MediaUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
