//! Configuration types and defaults

use consultrtc_core::{ConsultRtcError, ReconnectPolicy};
use consultrtc_media::{CompositeConfig, MediaConstraints, PipelineConfig, RetryPolicy};
use std::time::Duration;

/// Environment variable holding the signaling relay base URL
pub const ENV_SIGNALING_URL: &str = "CONSULTRTC_SIGNALING_URL";
/// Environment variable holding the notification relay base URL
pub const ENV_NOTIFICATION_URL: &str = "CONSULTRTC_NOTIFICATION_URL";
/// Environment variable holding the recording upload endpoint
pub const ENV_UPLOAD_URL: &str = "CONSULTRTC_UPLOAD_URL";
/// Optional ring timeout override, whole seconds
pub const ENV_RING_TIMEOUT_SECS: &str = "CONSULTRTC_RING_TIMEOUT_SECS";
/// Optional recording chunk duration override, milliseconds
pub const ENV_CHUNK_MILLIS: &str = "CONSULTRTC_CHUNK_MILLIS";

/// Global ConsultRTC configuration
#[derive(Debug, Clone)]
pub struct ConsultRtcConfig {
    /// Signaling relay base URL; the user id is appended
    pub signaling_url: String,
    /// Notification relay base URL; the user id is appended
    pub notification_url: String,
    /// Recording upload endpoint
    pub upload_url: String,
    /// Reconnect discipline for both channels
    pub reconnect: ReconnectPolicy,
    /// Timeout for one channel connect attempt
    pub connect_timeout: Duration,
    /// Notification keepalive interval
    pub keepalive_interval: Duration,
    /// Timeout for one upload request
    pub upload_timeout: Duration,
    /// Call behaviour
    pub call: CallConfig,
    /// Recording behaviour
    pub recording: RecordingConfig,
}

impl Default for ConsultRtcConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost/consultations/ws/create_signaling".to_string(),
            notification_url: "ws://localhost/consultations/ws/notifications".to_string(),
            upload_url: "http://localhost/consultations/recordings/upload".to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
            upload_timeout: Duration::from_secs(30),
            call: CallConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl ConsultRtcConfig {
    /// Build from `CONSULTRTC_*` environment variables
    pub fn from_env() -> Result<Self, ConsultRtcError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConsultRtcError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConsultRtcError> {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConsultRtcError::MissingConfiguration {
                    field: key.to_string(),
                })
        };

        let mut config = Self {
            signaling_url: required(ENV_SIGNALING_URL)?,
            notification_url: required(ENV_NOTIFICATION_URL)?,
            upload_url: required(ENV_UPLOAD_URL)?,
            ..Self::default()
        };

        if let Some(value) = lookup(ENV_RING_TIMEOUT_SECS) {
            config.call.ring_timeout = Duration::from_secs(parse_number(ENV_RING_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_CHUNK_MILLIS) {
            config.recording.chunk_duration =
                Duration::from_millis(parse_number(ENV_CHUNK_MILLIS, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConsultRtcError> {
        for (field, url) in [
            ("signaling_url", &self.signaling_url),
            ("notification_url", &self.notification_url),
        ] {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConsultRtcError::InvalidConfiguration {
                    field: field.to_string(),
                    reason: format!("expected a ws:// or wss:// URL, got {}", url),
                });
            }
        }
        if !(self.upload_url.starts_with("http://") || self.upload_url.starts_with("https://")) {
            return Err(ConsultRtcError::InvalidConfiguration {
                field: "upload_url".to_string(),
                reason: format!("expected an http(s) URL, got {}", self.upload_url),
            });
        }
        if self.call.ring_timeout.is_zero() {
            return Err(ConsultRtcError::InvalidConfiguration {
                field: "call.ring_timeout".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.call.send_attempts == 0 {
            return Err(ConsultRtcError::InvalidConfiguration {
                field: "call.send_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.recording.chunk_duration.is_zero() {
            return Err(ConsultRtcError::InvalidConfiguration {
                field: "recording.chunk_duration".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number(field: &str, value: &str) -> Result<u64, ConsultRtcError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConsultRtcError::InvalidConfiguration {
            field: field.to_string(),
            reason: format!("expected a positive integer, got {:?}", value),
        })
}

/// Per-call behaviour
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long the caller waits for an answer
    pub ring_timeout: Duration,
    /// Upper bound for the negotiating state
    pub negotiation_timeout: Duration,
    /// Attempts for offer and answer sends
    pub send_attempts: u32,
    /// Delay between send attempts
    pub send_retry_delay: Duration,
    /// Delay between connecting and starting the recorder
    pub recording_start_delay: Duration,
    /// Fall back to placeholder media when devices fail
    pub allow_placeholder_media: bool,
    /// Requested local media
    pub constraints: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            send_attempts: 3,
            send_retry_delay: Duration::from_millis(500),
            recording_start_delay: Duration::from_secs(1),
            allow_placeholder_media: true,
            constraints: MediaConstraints::default(),
        }
    }
}

/// How a call is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    /// Record local and remote tracks as one stream
    Direct,
    /// Tile video and mix audio of every participant
    Composited,
}

/// Recording behaviour
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Record calls at all
    pub enabled: bool,
    /// Capture strategy
    pub mode: RecordingMode,
    /// Chunk duration
    pub chunk_duration: Duration,
    /// Per-chunk retry policy
    pub retry: RetryPolicy,
    /// Grace period before fallback audio is acquired
    pub audio_grace: Duration,
    /// Canvas and mixer parameters
    pub composite: CompositeConfig,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RecordingMode::Direct,
            chunk_duration: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            audio_grace: Duration::from_secs(3),
            composite: CompositeConfig::default(),
        }
    }
}

impl RecordingConfig {
    /// Pipeline parameters derived from this configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            timeslice: self.chunk_duration,
            retry: self.retry.clone(),
            audio_grace: self.audio_grace,
            composite: self.composite.clone(),
        }
    }
}
