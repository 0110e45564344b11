//! # ConsultRTC - Telemedicine Calls
//!
//! ConsultRTC connects a patient and a doctor in a one-to-one video
//! consultation. Call control runs over a reconnecting signaling channel,
//! media runs over a pluggable peer connection backend, and every call is
//! recorded in chunks uploaded while the call is in progress.
//!
//! ## Key Features
//!
//! - **Explicit call lifecycle**: one state machine per call with a single,
//!   idempotent teardown
//! - **Reliable signaling**: bounded exponential reconnect and a buffered
//!   ICE candidate queue
//! - **Chunked recording**: gapless chunk indices, per-chunk retry and a
//!   final marker on every recording
//! - **Notifications**: per-user inbox with read tracking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use consultrtc::{ConsultRtc, ConsultRtcConfig, LoopbackNetwork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     consultrtc::init_logging();
//!
//!     let rtc = ConsultRtc::builder("patient-17")
//!         .config(ConsultRtcConfig::from_env()?)
//!         .peer_connections(LoopbackNetwork::new())
//!         .build()?;
//!
//!     let call = rtc
//!         .call("doctor-4")
//!         .consultation("c-981")
//!         .on_complete(|outcome| println!("call finished: {:?}", outcome.reason))
//!         .start()?;
//!
//!     let outcome = call.wait().await?;
//!     println!("{} after {:?}", outcome.state, outcome.duration);
//!     rtc.shutdown();
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use consultrtc_core::{
    ChannelState, ConsultRtcError, IceCandidate, ReconnectPolicy, Result, SdpType,
    SessionDescription,
};

pub use consultrtc_media::{
    CaptureStrategy, ChunkUpload, CompositeConfig, HttpUploadSink, JobStatus, MediaCapture,
    MediaConstraints, MediaError, MediaResult, MediaStream, MediaTrack, RecordingHandle,
    RecordingPipeline, RecordingReport, RetryPolicy, SyntheticCapture, TrackKind, UploadSink,
};

pub use consultrtc_signaling::{
    Connector, MessageKind, Notification, NotificationBus, NotificationEvent, NotificationType,
    RelayHandle, RelayServer, SignalingChannel, SignalingMessage, WebSocketConnector,
};

// Public API modules
pub mod call;
pub mod config;
pub mod incoming;
pub mod logging;
pub mod loopback;
pub mod peer;
pub mod registry;
pub mod status;

// Re-export main API types
pub use call::{
    CallDependencies, CallHandle, CallOutcome, CallRole, CallSession, CallSessionStateMachine,
    CallState, CompletionCallback, EndReason,
};
pub use config::{CallConfig, ConsultRtcConfig, RecordingConfig, RecordingMode};
pub use incoming::{IncomingCalls, Invitation};
pub use logging::{init_logging, init_logging_with};
pub use loopback::LoopbackNetwork;
pub use peer::{
    CandidateDisposition, PeerConnection, PeerConnectionFactory, PeerConnectionManager,
    PeerConnectionState, PeerEvent,
};
pub use registry::CallRegistry;
pub use status::{CallStatusSink, HttpCallStatusSink};

use std::sync::Arc;
use tracing::info;

/// Main entry point for ConsultRTC, one per signed-in user
#[derive(Debug, Clone)]
pub struct ConsultRtc {
    inner: Arc<ConsultRtcInner>,
}

#[derive(Debug)]
struct ConsultRtcInner {
    user_id: String,
    config: ConsultRtcConfig,
    notifications: NotificationBus,
    deps: CallDependencies,
}

impl ConsultRtc {
    /// Start configuring a client for `user_id`
    ///
    /// # Example
    /// ```rust,no_run
    /// use consultrtc::{ConsultRtc, LoopbackNetwork};
    ///
    /// # async fn example() -> Result<(), consultrtc::ConsultRtcError> {
    /// let rtc = ConsultRtc::builder("doctor-4")
    ///     .peer_connections(LoopbackNetwork::new())
    ///     .build()?;
    /// rtc.signaling().wait_until_open().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(user_id: &str) -> ConsultRtcBuilder {
        ConsultRtcBuilder::new(user_id)
    }

    /// Local user id
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Active configuration
    pub fn config(&self) -> &ConsultRtcConfig {
        &self.inner.config
    }

    /// Signaling channel of the local user
    pub fn signaling(&self) -> &SignalingChannel {
        &self.inner.deps.signaling
    }

    /// Notification inbox of the local user
    pub fn notifications(&self) -> &NotificationBus {
        &self.inner.notifications
    }

    /// Live call sessions
    pub fn registry(&self) -> &CallRegistry {
        &self.inner.deps.registry
    }

    /// Prepare an outgoing call to `callee_id`
    pub fn call(&self, callee_id: &str) -> CallBuilder {
        CallBuilder::new(self.clone(), callee_id)
    }

    /// Listen for incoming calls
    pub fn incoming_calls(&self) -> IncomingCalls {
        IncomingCalls::new(self.inner.deps.signaling.clone())
    }

    /// Answer an invitation
    pub fn accept(&self, invitation: Invitation) -> Result<CallHandle> {
        CallSessionStateMachine::accept(&self.inner.deps, invitation, None)
    }

    /// Answer an invitation, reporting the outcome to `on_complete`
    pub fn accept_with<F>(&self, invitation: Invitation, on_complete: F) -> Result<CallHandle>
    where
        F: FnOnce(&CallOutcome) + Send + 'static,
    {
        CallSessionStateMachine::accept(&self.inner.deps, invitation, Some(Box::new(on_complete)))
    }

    /// Close both channels. Calls still running fail with `signaling-lost`.
    pub fn shutdown(&self) {
        info!(user_id = %self.inner.user_id, "Shutting down");
        self.inner.deps.signaling.close();
        self.inner.notifications.close();
    }
}

/// Fluent builder for [`ConsultRtc`]
pub struct ConsultRtcBuilder {
    user_id: String,
    config: ConsultRtcConfig,
    connector: Option<Arc<dyn Connector>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    capture: Option<Arc<dyn MediaCapture>>,
    upload_sink: Option<Arc<dyn UploadSink>>,
    status: Option<Arc<dyn CallStatusSink>>,
}

impl std::fmt::Debug for ConsultRtcBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsultRtcBuilder")
            .field("user_id", &self.user_id)
            .field("config", &self.config)
            .field("peers", &self.peers.is_some())
            .finish()
    }
}

impl ConsultRtcBuilder {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            config: ConsultRtcConfig::default(),
            connector: None,
            peers: None,
            capture: None,
            upload_sink: None,
            status: None,
        }
    }

    /// Use `config` instead of the defaults
    pub fn config(mut self, config: ConsultRtcConfig) -> Self {
        self.config = config;
        self
    }

    /// Peer connection backend (required)
    pub fn peer_connections(mut self, factory: impl PeerConnectionFactory + 'static) -> Self {
        self.peers = Some(Arc::new(factory));
        self
    }

    /// Transport for the signaling and notification channels
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Local media backend
    pub fn media_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Destination for recording chunks
    pub fn upload_sink(mut self, sink: Arc<dyn UploadSink>) -> Self {
        self.upload_sink = Some(sink);
        self
    }

    /// Report every finished call to `sink`
    pub fn call_status(mut self, sink: Arc<dyn CallStatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    /// Connect both channels. Must run inside a Tokio runtime.
    pub fn build(self) -> Result<ConsultRtc> {
        if self.user_id.trim().is_empty() {
            return Err(ConsultRtcError::MissingConfiguration {
                field: "user_id".to_string(),
            });
        }
        let peers = self.peers.ok_or_else(|| ConsultRtcError::MissingConfiguration {
            field: "peer_connections".to_string(),
        })?;
        self.config.validate()?;
        let config = self.config;

        let connector: Arc<dyn Connector> = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new(config.connect_timeout)));
        let capture: Arc<dyn MediaCapture> = self
            .capture
            .unwrap_or_else(|| Arc::new(SyntheticCapture::new()));

        let recording = if config.recording.enabled {
            let sink: Arc<dyn UploadSink> = match self.upload_sink {
                Some(sink) => sink,
                None => Arc::new(HttpUploadSink::new(
                    config.upload_url.clone(),
                    config.upload_timeout,
                )?),
            };
            Some(RecordingPipeline::new(
                sink,
                capture.clone(),
                config.recording.pipeline_config(),
            ))
        } else {
            None
        };

        let signaling = SignalingChannel::connect_with(
            connector.clone(),
            &config.signaling_url,
            self.user_id.clone(),
            config.reconnect.clone(),
        );
        let notifications = NotificationBus::connect_with(
            connector,
            &config.notification_url,
            self.user_id.clone(),
            config.reconnect.clone(),
            config.keepalive_interval,
        );

        info!(user_id = %self.user_id, signaling_url = %config.signaling_url, "ConsultRTC client started");

        let deps = CallDependencies {
            signaling,
            peers,
            capture,
            recording,
            registry: CallRegistry::new(),
            config: config.call.clone(),
            recording_mode: config.recording.mode,
            status: self.status,
        };
        Ok(ConsultRtc {
            inner: Arc::new(ConsultRtcInner {
                user_id: self.user_id,
                config,
                notifications,
                deps,
            }),
        })
    }
}

/// Fluent builder for an outgoing call
pub struct CallBuilder {
    rtc: ConsultRtc,
    callee_id: String,
    consultation_id: String,
    recording: bool,
    recording_mode: Option<RecordingMode>,
    on_complete: Option<CompletionCallback>,
}

impl std::fmt::Debug for CallBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBuilder")
            .field("callee_id", &self.callee_id)
            .field("consultation_id", &self.consultation_id)
            .field("recording", &self.recording)
            .finish()
    }
}

impl CallBuilder {
    fn new(rtc: ConsultRtc, callee_id: &str) -> Self {
        Self {
            rtc,
            callee_id: callee_id.to_string(),
            consultation_id: String::new(),
            recording: true,
            recording_mode: None,
            on_complete: None,
        }
    }

    /// Consultation the call belongs to
    pub fn consultation(mut self, consultation_id: &str) -> Self {
        self.consultation_id = consultation_id.to_string();
        self
    }

    /// Override the configured recording strategy
    pub fn recording_mode(mut self, mode: RecordingMode) -> Self {
        self.recording_mode = Some(mode);
        self
    }

    /// Do not record this call
    pub fn without_recording(mut self) -> Self {
        self.recording = false;
        self
    }

    /// Called once with the outcome
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CallOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Place the call
    pub fn start(self) -> Result<CallHandle> {
        if self.callee_id.trim().is_empty() || self.callee_id == self.rtc.user_id() {
            return Err(ConsultRtcError::InvalidConfiguration {
                field: "callee_id".to_string(),
                reason: format!("cannot call {:?}", self.callee_id),
            });
        }
        let mut deps = self.rtc.inner.deps.clone();
        if !self.recording {
            deps.recording = None;
        }
        if let Some(mode) = self.recording_mode {
            deps.recording_mode = mode;
        }
        CallSessionStateMachine::place(
            &deps,
            &self.callee_id,
            &self.consultation_id,
            self.on_complete,
        )
    }
}
