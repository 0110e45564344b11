//! Call session state machine
//!
//! Each call runs as one task consuming an ordered stream of inputs: handle
//! commands, inbound signaling, peer events, channel lifecycle events and
//! its own timers. The task owns the [`CallSession`] and drives the
//! [`PeerConnectionManager`]:
//!
//! ```text
//! caller: Idle -> Offering -> Ringing -> Negotiating -> Connected
//! callee: Idle -> Negotiating -> Connected
//! any non-terminal state -> Ended | Failed
//! ```
//!
//! Teardown runs exactly once: local tracks stop, the peer connection
//! closes, the recording flushes and the completion callback fires.

use crate::config::{CallConfig, RecordingMode};
use crate::incoming::Invitation;
use crate::peer::{PeerConnectionFactory, PeerConnectionManager, PeerConnectionState, PeerEvent};
use crate::registry::{CallRegistry, RegistryGuard};
use crate::status::CallStatusSink;
use chrono::{DateTime, Utc};
use consultrtc_core::{ConsultRtcError, Result, SessionDescription};
use consultrtc_media::{
    acquire_with_fallback, CaptureStrategy, MediaCapture, MediaStream, MediaTrack,
    RecordingHandle, RecordingPipeline, TrackKind,
};
use consultrtc_signaling::{ChannelEvent, SignalingChannel, SignalingMessage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Not started
    Idle,
    /// Offer sent, delivery not yet confirmed
    Offering,
    /// Offer delivered, waiting for an answer
    Ringing,
    /// Descriptions exchanged, waiting for media
    Negotiating,
    /// Remote media flowing
    Connected,
    /// Hung up by either side
    Ended,
    /// Ended by an error or timeout
    Failed,
}

impl CallState {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Offering => "offering",
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of the call the local user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    /// Sent the offer
    Caller,
    /// Answered the offer
    Callee,
}

/// Why a call reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote party sent `call-end`
    RemoteHangup,
    /// Callee declined
    Rejected,
    /// No answer before the ring timeout
    NoAnswer,
    /// Media did not arrive before the negotiation timeout
    NegotiationTimeout,
    /// Offer, answer or description could not be applied
    NegotiationFailed,
    /// No local media, not even a placeholder
    MediaUnavailable,
    /// Signaling channel gave up or could not send
    SignalingLost,
    /// Peer transport failed
    PeerFailed,
}

impl EndReason {
    /// Wire-style name
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local-hangup",
            EndReason::RemoteHangup => "remote-hangup",
            EndReason::Rejected => "rejected",
            EndReason::NoAnswer => "no-answer",
            EndReason::NegotiationTimeout => "negotiation-timeout",
            EndReason::NegotiationFailed => "negotiation-failed",
            EndReason::MediaUnavailable => "media-unavailable",
            EndReason::SignalingLost => "signaling-lost",
            EndReason::PeerFailed => "peer-failed",
        }
    }

    /// `Ended` for hangups and rejections, `Failed` otherwise
    pub fn terminal_state(&self) -> CallState {
        match self {
            EndReason::LocalHangup | EndReason::RemoteHangup | EndReason::Rejected => {
                CallState::Ended
            }
            _ => CallState::Failed,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call between two users
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    /// Session id
    pub id: String,
    /// Local side
    pub role: CallRole,
    /// Calling user
    pub caller_id: String,
    /// Called user
    pub callee_id: String,
    /// Consultation the call belongs to
    pub consultation_id: String,
    /// Current state
    pub state: CallState,
    /// Applied local description
    pub local_description: Option<SessionDescription>,
    /// Applied remote description
    pub remote_description: Option<SessionDescription>,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// When remote media first arrived
    pub connected_at: Option<DateTime<Utc>>,
    /// When the call reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Local user id
    pub fn local_id(&self) -> &str {
        match self.role {
            CallRole::Caller => &self.caller_id,
            CallRole::Callee => &self.callee_id,
        }
    }

    /// Remote user id
    pub fn remote_id(&self) -> &str {
        match self.role {
            CallRole::Caller => &self.callee_id,
            CallRole::Callee => &self.caller_id,
        }
    }
}

/// Result of a finished call
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Session id
    pub session_id: String,
    /// `Ended` or `Failed`
    pub state: CallState,
    /// Why the call ended
    pub reason: EndReason,
    /// Error that ended the call, if any
    pub error: Option<String>,
    /// Time spent connected
    pub duration: Option<Duration>,
}

/// Called once with the outcome of a call
pub type CompletionCallback = Box<dyn FnOnce(&CallOutcome) + Send + 'static>;

/// Collaborators a call needs
#[derive(Clone)]
pub struct CallDependencies {
    /// Signaling channel of the local user
    pub signaling: SignalingChannel,
    /// Peer connection backend
    pub peers: Arc<dyn PeerConnectionFactory>,
    /// Local media backend
    pub capture: Arc<dyn MediaCapture>,
    /// Recording pipeline, `None` to disable recording
    pub recording: Option<RecordingPipeline>,
    /// Live session registry
    pub registry: CallRegistry,
    /// Call behaviour
    pub config: CallConfig,
    /// Recording strategy
    pub recording_mode: RecordingMode,
    /// Told about every finished call, `None` to skip
    pub status: Option<Arc<dyn CallStatusSink>>,
}

impl fmt::Debug for CallDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDependencies")
            .field("user_id", &self.signaling.user_id())
            .field("recording", &self.recording.is_some())
            .field("status", &self.status.is_some())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug)]
enum CallCommand {
    Hangup,
}

struct Shared {
    session: Mutex<CallSession>,
    state: watch::Sender<CallState>,
    ending: AtomicBool,
}

/// Control handle of a running call
#[derive(Clone)]
pub struct CallHandle {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<CallCommand>,
    manager: Arc<PeerConnectionManager>,
    recording: Option<RecordingHandle>,
    outcome: watch::Receiver<Option<CallOutcome>>,
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("session", &*self.shared.session.lock())
            .finish()
    }
}

impl CallHandle {
    /// Session id
    pub fn session_id(&self) -> String {
        self.shared.session.lock().id.clone()
    }

    /// Snapshot of the session
    pub fn session(&self) -> CallSession {
        self.shared.session.lock().clone()
    }

    /// Current state
    pub fn state(&self) -> CallState {
        *self.shared.state.borrow()
    }

    /// Watch state changes
    pub fn state_watch(&self) -> watch::Receiver<CallState> {
        self.shared.state.subscribe()
    }

    /// Wait until the call reaches `state` or ends
    pub async fn wait_for_state(&self, state: CallState) -> CallState {
        let mut watch = self.state_watch();
        let reached = match watch.wait_for(|s| *s == state || s.is_terminal()).await {
            Ok(reached) => *reached,
            Err(_) => self.state(),
        };
        reached
    }

    /// Hang up. Safe to call any number of times from any task.
    pub fn hangup(&self) {
        if self.shared.ending.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(CallCommand::Hangup);
    }

    /// Mute or unmute the microphone. Returns the number of tracks changed.
    pub fn set_audio_enabled(&self, enabled: bool) -> usize {
        self.manager.set_track_enabled(TrackKind::Audio, enabled)
    }

    /// Turn the camera on or off. Returns the number of tracks changed.
    pub fn set_video_enabled(&self, enabled: bool) -> usize {
        self.manager.set_track_enabled(TrackKind::Video, enabled)
    }

    /// Local tracks
    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.manager.local_tracks()
    }

    /// Remote tracks received so far
    pub fn remote_tracks(&self) -> Vec<MediaTrack> {
        self.manager.remote_tracks()
    }

    /// Recording job of this call
    pub fn recording(&self) -> Option<&RecordingHandle> {
        self.recording.as_ref()
    }

    /// Outcome, once the call has ended
    pub fn outcome(&self) -> Option<CallOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the call to end
    pub async fn wait(&self) -> Result<CallOutcome> {
        let mut outcome = self.outcome.clone();
        let done = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ConsultRtcError::InvalidState {
                expected: "call outcome".to_string(),
                actual: "call task aborted".to_string(),
            })?
            .clone();
        done.ok_or_else(|| ConsultRtcError::InvalidState {
            expected: "call outcome".to_string(),
            actual: "no outcome".to_string(),
        })
    }
}

struct Termination {
    reason: EndReason,
    error: Option<String>,
    notify_remote: bool,
}

impl Termination {
    fn new(reason: EndReason) -> Self {
        Self {
            reason,
            error: None,
            notify_remote: false,
        }
    }

    fn failed(reason: EndReason, error: impl ToString) -> Self {
        Self {
            reason,
            error: Some(error.to_string()),
            notify_remote: false,
        }
    }

    fn notify(mut self) -> Self {
        self.notify_remote = true;
        self
    }
}

enum Opening {
    Outgoing,
    Incoming(SessionDescription),
}

/// Input streams of one call task
struct CallInputs {
    commands: mpsc::UnboundedReceiver<CallCommand>,
    inbound: broadcast::Receiver<SignalingMessage>,
    backlog: VecDeque<SignalingMessage>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    channel_events: broadcast::Receiver<ChannelEvent>,
}

impl CallInputs {
    /// Wait for something that ends a call before it is open: a hangup,
    /// a `call-end` from `remote_id` or the loss of the signaling channel.
    /// Other messages are kept for the event loop.
    async fn interruption(&mut self, remote_id: &str) -> Termination {
        let ended = self.backlog.iter().any(|message| {
            matches!(message, SignalingMessage::CallEnd { sender_id, .. } if sender_id == remote_id)
        });
        if ended {
            return Termination::new(EndReason::RemoteHangup);
        }
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(CallCommand::Hangup) | None => {
                        return Termination::new(EndReason::LocalHangup);
                    }
                },
                message = self.inbound.recv() => match message {
                    Ok(SignalingMessage::CallEnd { sender_id, .. }) if sender_id == remote_id => {
                        return Termination::new(EndReason::RemoteHangup);
                    }
                    Ok(message) => self.backlog.push_back(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(remote = %remote_id, skipped, "Signaling subscriber lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Termination::failed(EndReason::SignalingLost, "signaling channel dropped");
                    }
                },
                event = self.channel_events.recv() => {
                    if let Some(end) = channel_loss(event, remote_id) {
                        return end;
                    }
                }
            }
        }
    }
}

/// Termination for a channel lifecycle event, `None` when the call can go on
fn channel_loss(
    event: std::result::Result<ChannelEvent, RecvError>,
    remote_id: &str,
) -> Option<Termination> {
    match event {
        Ok(ChannelEvent::GaveUp { attempts }) => Some(Termination::failed(
            EndReason::SignalingLost,
            ConsultRtcError::ChannelExhausted {
                channel: "signaling".to_string(),
                attempts,
            },
        )),
        Ok(ChannelEvent::ClosedByServer) | Ok(ChannelEvent::Closed) => Some(Termination::failed(
            EndReason::SignalingLost,
            "signaling channel closed",
        )),
        Ok(ChannelEvent::ReconnectScheduled { attempt, delay }) => {
            warn!(remote = %remote_id, attempt, delay_secs = delay.as_secs(), "Signaling reconnecting mid-call");
            None
        }
        Ok(ChannelEvent::Opened) | Err(RecvError::Lagged(_)) => None,
        Err(RecvError::Closed) => Some(Termination::failed(
            EndReason::SignalingLost,
            "signaling channel dropped",
        )),
    }
}

/// Drives one call from start to teardown
pub struct CallSessionStateMachine {
    shared: Arc<Shared>,
    session_id: String,
    local_id: String,
    remote_id: String,
    role: CallRole,
    manager: Arc<PeerConnectionManager>,
    signaling: SignalingChannel,
    capture: Arc<dyn MediaCapture>,
    config: CallConfig,
    recording_mode: RecordingMode,
    recording: Option<RecordingHandle>,
    status: Option<Arc<dyn CallStatusSink>>,
    on_complete: Mutex<Option<CompletionCallback>>,
    ring_deadline: Option<Instant>,
    negotiation_deadline: Option<Instant>,
    recording_at: Option<Instant>,
    outcome: watch::Sender<Option<CallOutcome>>,
    registration: Option<RegistryGuard>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl CallSessionStateMachine {
    /// Call `callee_id` for `consultation_id`
    pub fn place(
        deps: &CallDependencies,
        callee_id: &str,
        consultation_id: &str,
        on_complete: Option<CompletionCallback>,
    ) -> Result<CallHandle> {
        let caller_id = deps.signaling.user_id().to_string();
        let inbound = deps.signaling.subscribe();
        let (machine, inputs, handle) = Self::build(
            deps,
            CallRole::Caller,
            caller_id,
            callee_id.to_string(),
            consultation_id.to_string(),
            inbound,
            VecDeque::new(),
            on_complete,
        )?;
        tokio::spawn(machine.run(inputs, Opening::Outgoing));
        Ok(handle)
    }

    /// Accept an incoming invitation
    pub fn accept(
        deps: &CallDependencies,
        invitation: Invitation,
        on_complete: Option<CompletionCallback>,
    ) -> Result<CallHandle> {
        let callee_id = deps.signaling.user_id().to_string();
        let (caller_id, consultation_id, offer, inbound, backlog) = invitation.into_parts();
        let (machine, inputs, handle) = Self::build(
            deps,
            CallRole::Callee,
            caller_id,
            callee_id,
            consultation_id,
            inbound,
            backlog,
            on_complete,
        )?;
        tokio::spawn(machine.run(inputs, Opening::Incoming(offer)));
        Ok(handle)
    }

    fn build(
        deps: &CallDependencies,
        role: CallRole,
        caller_id: String,
        callee_id: String,
        consultation_id: String,
        inbound: broadcast::Receiver<SignalingMessage>,
        backlog: VecDeque<SignalingMessage>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(Self, CallInputs, CallHandle)> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let registration = deps.registry.register(&caller_id, &callee_id, &session_id)?;
        let (manager, peer_events) = PeerConnectionManager::new(session_id.clone(), deps.peers.as_ref())?;
        let manager = Arc::new(manager);

        let session = CallSession {
            id: session_id.clone(),
            role,
            caller_id,
            callee_id,
            consultation_id,
            state: CallState::Idle,
            local_description: None,
            remote_description: None,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        };
        let local_id = session.local_id().to_string();
        let remote_id = session.remote_id().to_string();
        let room_id = if session.consultation_id.is_empty() {
            session_id.clone()
        } else {
            session.consultation_id.clone()
        };
        let recording = deps
            .recording
            .as_ref()
            .map(|pipeline| pipeline.arm(room_id, local_id.clone()));

        let shared = Arc::new(Shared {
            session: Mutex::new(session),
            state: watch::channel(CallState::Idle).0,
            ending: AtomicBool::new(false),
        });
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        info!(
            session_id = %session_id,
            role = ?role,
            local = %local_id,
            remote = %remote_id,
            "Call session created"
        );

        let machine = Self {
            shared: shared.clone(),
            session_id,
            local_id,
            remote_id,
            role,
            manager: manager.clone(),
            signaling: deps.signaling.clone(),
            capture: deps.capture.clone(),
            config: deps.config.clone(),
            recording_mode: deps.recording_mode,
            recording: recording.clone(),
            status: deps.status.clone(),
            on_complete: Mutex::new(on_complete),
            ring_deadline: None,
            negotiation_deadline: None,
            recording_at: None,
            outcome: outcome_tx,
            registration: Some(registration),
        };
        let inputs = CallInputs {
            commands: commands_rx,
            inbound,
            backlog,
            peer_events,
            channel_events: deps.signaling.channel().events(),
        };
        let handle = CallHandle {
            shared,
            commands: commands_tx,
            manager,
            recording,
            outcome: outcome_rx,
        };
        Ok((machine, inputs, handle))
    }

    async fn run(mut self, mut inputs: CallInputs, opening: Opening) -> CallOutcome {
        let remote_id = self.remote_id.clone();
        // Dropping an unfinished opening cancels it before its message is sent
        let opened = tokio::select! {
            biased;
            interrupted = inputs.interruption(&remote_id) => Err(self.interrupted(interrupted)),
            opened = self.open(opening) => opened,
        };
        let termination = match opened {
            Ok(()) => self.event_loop(&mut inputs).await,
            Err(termination) => termination,
        };
        self.terminate(termination).await
    }

    async fn open(&mut self, opening: Opening) -> std::result::Result<(), Termination> {
        match opening {
            Opening::Outgoing => self.place_call().await,
            Opening::Incoming(offer) => self.answer_call(offer).await,
        }
    }

    fn interrupted(&self, termination: Termination) -> Termination {
        info!(
            session_id = %self.session_id,
            reason = %termination.reason,
            state = %self.state(),
            "Call ended while opening"
        );
        // The caller is already ringing for an accepted invitation
        if termination.reason == EndReason::LocalHangup && self.role == CallRole::Callee {
            termination.notify()
        } else {
            termination
        }
    }

    fn state(&self) -> CallState {
        self.shared.session.lock().state
    }

    fn transition(&self, next: CallState) {
        let previous = {
            let mut session = self.shared.session.lock();
            if session.state.is_terminal() || session.state == next {
                return;
            }
            let previous = session.state;
            session.state = next;
            if next == CallState::Connected {
                session.connected_at = Some(Utc::now());
            }
            previous
        };
        self.shared.state.send_replace(next);
        info!(session_id = %self.session_id, from = %previous, to = %next, "Call state changed");
    }

    async fn send_with_retry(&self, message: &SignalingMessage) -> Result<()> {
        let attempts = self.config.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.signaling.send(message) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        session_id = %self.session_id,
                        kind = %message.kind(),
                        attempt,
                        "Send failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(self.config.send_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire_local_media(&self) -> std::result::Result<(), Termination> {
        let stream = acquire_with_fallback(
            self.capture.as_ref(),
            &self.config.constraints,
            self.config.allow_placeholder_media,
        )
        .await
        .map_err(|e| {
            error!(session_id = %self.session_id, "No local media: {}", e);
            Termination::failed(EndReason::MediaUnavailable, ConsultRtcError::from(e))
        })?;

        for track in stream.tracks() {
            self.manager
                .add_local_track(track.clone())
                .map_err(|e| Termination::failed(EndReason::NegotiationFailed, e))?;
        }
        Ok(())
    }

    async fn place_call(&mut self) -> std::result::Result<(), Termination> {
        self.acquire_local_media().await?;
        let offer = self
            .manager
            .create_offer()
            .await
            .map_err(|e| Termination::failed(EndReason::NegotiationFailed, e))?;

        let consultation_id = {
            let mut session = self.shared.session.lock();
            session.local_description = Some(offer.clone());
            session.consultation_id.clone()
        };
        self.transition(CallState::Offering);
        self.ring_deadline = Some(Instant::now() + self.config.ring_timeout);

        let initiate = SignalingMessage::CallInitiate {
            target_id: self.remote_id.clone(),
            sender_id: self.local_id.clone(),
            consultation_id,
            offer,
        };
        self.send_with_retry(&initiate)
            .await
            .map_err(|e| Termination::failed(EndReason::SignalingLost, e))
    }

    async fn answer_call(&mut self, offer: SessionDescription) -> std::result::Result<(), Termination> {
        self.acquire_local_media()
            .await
            .map_err(Termination::notify)?;
        let answer = self
            .manager
            .create_answer(&offer)
            .await
            .map_err(|e| Termination::failed(EndReason::NegotiationFailed, e).notify())?;

        {
            let mut session = self.shared.session.lock();
            session.remote_description = Some(offer);
            session.local_description = Some(answer.clone());
        }
        self.transition(CallState::Negotiating);
        self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);

        let reply = SignalingMessage::CallAnswer {
            target_id: self.remote_id.clone(),
            sender_id: self.local_id.clone(),
            answer,
        };
        self.send_with_retry(&reply)
            .await
            .map_err(|e| Termination::failed(EndReason::SignalingLost, e))
    }

    async fn event_loop(&mut self, inputs: &mut CallInputs) -> Termination {
        while let Some(message) = inputs.backlog.pop_front() {
            if let Some(end) = self.on_signal(message).await {
                return end;
            }
        }
        loop {
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(CallCommand::Hangup) | None => {
                        return Termination::new(EndReason::LocalHangup).notify();
                    }
                },
                message = inputs.inbound.recv() => match message {
                    Ok(message) => {
                        if let Some(end) = self.on_signal(message).await {
                            return end;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %self.session_id, skipped, "Signaling subscriber lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Termination::failed(EndReason::SignalingLost, "signaling channel dropped");
                    }
                },
                event = inputs.peer_events.recv() => match event {
                    Some(event) => {
                        if let Some(end) = self.on_peer_event(event) {
                            return end;
                        }
                    }
                    None => {
                        return Termination::failed(EndReason::PeerFailed, "peer connection dropped").notify();
                    }
                },
                event = inputs.channel_events.recv() => {
                    if let Some(end) = channel_loss(event, &self.remote_id) {
                        return end;
                    }
                }
                _ = deadline(self.ring_deadline) => {
                    warn!(session_id = %self.session_id, "No answer before ring timeout");
                    return Termination::new(EndReason::NoAnswer).notify();
                }
                _ = deadline(self.negotiation_deadline) => {
                    warn!(session_id = %self.session_id, "Negotiation timed out");
                    return Termination::failed(
                        EndReason::NegotiationTimeout,
                        ConsultRtcError::Timeout {
                            operation: "negotiation".to_string(),
                            duration: self.config.negotiation_timeout,
                        },
                    )
                    .notify();
                }
                _ = deadline(self.recording_at) => {
                    self.recording_at = None;
                    self.start_recording();
                }
            }
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) -> Option<Termination> {
        match message {
            SignalingMessage::MessageAck {
                original_type,
                status,
                to,
            } => {
                if to == self.remote_id
                    && original_type == "call-initiate"
                    && status == "delivered"
                    && self.state() == CallState::Offering
                {
                    self.transition(CallState::Ringing);
                }
                None
            }
            other if other.sender_id() != Some(self.remote_id.as_str()) => {
                debug!(session_id = %self.session_id, kind = %other.kind(), "Ignoring message for another call");
                None
            }
            SignalingMessage::CallAnswer { answer, .. } => self.on_answer(answer).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                if let Err(e) = self.manager.apply_remote_candidate(candidate).await {
                    warn!(session_id = %self.session_id, "Remote candidate dropped: {}", e);
                }
                None
            }
            SignalingMessage::CallEnd { .. } => {
                info!(session_id = %self.session_id, "Remote party hung up");
                Some(Termination::new(EndReason::RemoteHangup))
            }
            SignalingMessage::CallRejected { .. } if self.role == CallRole::Caller => {
                info!(session_id = %self.session_id, "Call rejected");
                Some(Termination::new(EndReason::Rejected))
            }
            other => {
                warn!(session_id = %self.session_id, kind = %other.kind(), state = %self.state(), "Unexpected message");
                None
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Option<Termination> {
        let state = self.state();
        if self.role != CallRole::Caller || !matches!(state, CallState::Offering | CallState::Ringing) {
            warn!(session_id = %self.session_id, state = %state, "Ignoring answer, renegotiation is not supported");
            return None;
        }
        if let Err(e) = self.manager.set_remote_description(&answer).await {
            error!(session_id = %self.session_id, "Failed to apply answer: {}", e);
            return Some(Termination::failed(EndReason::NegotiationFailed, e).notify());
        }
        self.shared.session.lock().remote_description = Some(answer);
        self.ring_deadline = None;
        self.transition(CallState::Negotiating);
        self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
        // Media may already have arrived while the answer was applied
        if !self.manager.remote_tracks().is_empty() {
            self.on_connected();
        }
        None
    }

    fn on_peer_event(&mut self, event: PeerEvent) -> Option<Termination> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let message = SignalingMessage::IceCandidate {
                    target_id: self.remote_id.clone(),
                    sender_id: self.local_id.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(&message) {
                    warn!(session_id = %self.session_id, "Local candidate not sent: {}", e);
                }
                None
            }
            PeerEvent::RemoteTrack(track) => {
                let kind = track.kind();
                if self.manager.add_remote_track(track) {
                    debug!(session_id = %self.session_id, kind = ?kind, "Remote track received");
                }
                if self.state() == CallState::Negotiating {
                    self.on_connected();
                }
                None
            }
            PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                error!(session_id = %self.session_id, "Peer connection failed");
                Some(Termination::failed(EndReason::PeerFailed, "peer connection failed").notify())
            }
            PeerEvent::StateChanged(PeerConnectionState::Disconnected) => {
                warn!(session_id = %self.session_id, "Peer connection disconnected");
                None
            }
            PeerEvent::StateChanged(state) => {
                debug!(session_id = %self.session_id, peer_state = %state, "Peer state changed");
                None
            }
        }
    }

    fn on_connected(&mut self) {
        self.negotiation_deadline = None;
        self.transition(CallState::Connected);
        if self.recording.is_some() {
            self.recording_at = Some(Instant::now() + self.config.recording_start_delay);
        }
    }

    fn start_recording(&self) {
        let Some(recording) = &self.recording else {
            return;
        };
        if self.state() != CallState::Connected {
            return;
        }
        let local = self.manager.local_tracks();
        let remote = self.manager.remote_tracks();
        let strategy = match self.recording_mode {
            RecordingMode::Direct => CaptureStrategy::Direct {
                stream: MediaStream::with_tracks(local.into_iter().chain(remote).collect()),
            },
            RecordingMode::Composited => CaptureStrategy::Composited {
                participants: vec![MediaStream::with_tracks(local), MediaStream::with_tracks(remote)],
            },
        };
        if let Err(e) = recording.start(strategy) {
            warn!(session_id = %self.session_id, "Recording not started: {}", e);
        }
    }

    async fn terminate(mut self, termination: Termination) -> CallOutcome {
        let state = termination.reason.terminal_state();
        if self.shared.ending.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.session_id, "Teardown already ran");
        }

        if termination.notify_remote {
            let end = SignalingMessage::call_end(&self.local_id, &self.remote_id);
            if let Err(e) = self.signaling.send(&end) {
                debug!(session_id = %self.session_id, "call-end not delivered: {}", e);
            }
        }
        self.manager.close().await;
        if let Some(recording) = &self.recording {
            recording.flush();
        }

        let duration = {
            let mut session = self.shared.session.lock();
            let ended_at = Utc::now();
            session.state = state;
            session.ended_at = Some(ended_at);
            session
                .connected_at
                .and_then(|connected| (ended_at - connected).to_std().ok())
        };
        self.shared.state.send_replace(state);

        let outcome = CallOutcome {
            session_id: self.session_id.clone(),
            state,
            reason: termination.reason,
            error: termination.error,
            duration,
        };
        match state {
            CallState::Failed => warn!(
                session_id = %self.session_id,
                reason = %outcome.reason,
                error = outcome.error.as_deref().unwrap_or(""),
                "Call failed"
            ),
            _ => info!(session_id = %self.session_id, reason = %outcome.reason, "Call ended"),
        }

        self.registration.take();
        self.outcome.send_replace(Some(outcome.clone()));
        let on_complete = self.on_complete.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete(&outcome);
        }
        if let Some(status) = &self.status {
            let session = self.shared.session.lock().clone();
            if let Err(e) = status.call_finished(&session, &outcome).await {
                warn!(session_id = %self.session_id, "Call status not reported: {}", e);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_states() {
        assert_eq!(EndReason::RemoteHangup.terminal_state(), CallState::Ended);
        assert_eq!(EndReason::Rejected.terminal_state(), CallState::Ended);
        assert_eq!(EndReason::NoAnswer.terminal_state(), CallState::Failed);
        assert_eq!(EndReason::NoAnswer.as_str(), "no-answer");
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::Connected.is_terminal());
    }
}
