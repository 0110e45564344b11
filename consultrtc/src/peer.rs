//! Peer connection management
//!
//! [`PeerConnection`] is the platform seam. [`PeerConnectionManager`] owns
//! one connection per call and adds the call-level rules on top: a single
//! offer/answer exchange, remote candidates buffered until the remote
//! description is applied, and an idempotent close.

use async_trait::async_trait;
use consultrtc_core::{ConsultRtcError, IceCandidate, Result, SessionDescription};
use consultrtc_media::{MediaTrack, TrackKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport state reported by a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    /// Created, nothing negotiated
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Closed locally
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the remote party
    LocalCandidate(IceCandidate),
    /// A remote media track arrived
    RemoteTrack(MediaTrack),
    /// Transport state changed
    StateChanged(PeerConnectionState),
}

/// Platform peer connection capability
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description; starts candidate gathering
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Attach a local track
    fn add_track(&self, track: &MediaTrack) -> Result<()>;

    /// Release transport resources
    async fn close(&self);
}

/// Creates peer connections that report into an event queue
pub trait PeerConnectionFactory: Send + Sync {
    /// New connection for `session_id`
    fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is applied
    Queued,
    /// Applied to the connection
    Applied,
    /// Rejected by the connection and dropped
    Skipped,
}

#[derive(Debug, Default)]
struct RemoteSide {
    description_applied: bool,
    pending: VecDeque<IceCandidate>,
}

/// One peer connection per call
pub struct PeerConnectionManager {
    session_id: String,
    peer: Arc<dyn PeerConnection>,
    remote: tokio::sync::Mutex<RemoteSide>,
    local_tracks: Mutex<Vec<MediaTrack>>,
    remote_tracks: Mutex<Vec<MediaTrack>>,
    local_description: Mutex<Option<SessionDescription>>,
    negotiated: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("session_id", &self.session_id)
            .field("local_tracks", &self.local_tracks.lock().len())
            .field("remote_tracks", &self.remote_tracks.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnectionManager {
    /// Create the connection for `session_id`. Peer events arrive on the
    /// returned receiver in the order the connection raised them.
    pub fn new(
        session_id: impl Into<String>,
        factory: &dyn PeerConnectionFactory,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let session_id = session_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = factory.create(&session_id, events_tx)?;
        debug!(session_id = %session_id, "Peer connection created");
        Ok((
            Self {
                session_id,
                peer,
                remote: tokio::sync::Mutex::new(RemoteSide::default()),
                local_tracks: Mutex::new(Vec::new()),
                remote_tracks: Mutex::new(Vec::new()),
                local_description: Mutex::new(None),
                negotiated: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    /// Session this connection belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConsultRtcError::PeerClosed);
        }
        Ok(())
    }

    fn begin_negotiation(&self, operation: &str) -> Result<()> {
        if self.negotiated.swap(true, Ordering::SeqCst) {
            return Err(ConsultRtcError::RenegotiationUnsupported {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Attach a local track before negotiating
    pub fn add_local_track(&self, track: MediaTrack) -> Result<()> {
        self.ensure_open()?;
        self.peer.add_track(&track)?;
        debug!(session_id = %self.session_id, track = %track.id(), kind = ?track.kind(), "Local track added");
        self.local_tracks.lock().push(track);
        Ok(())
    }

    /// Create and apply the offer. Only one offer or answer per session.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.begin_negotiation("create_offer")?;
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(&offer).await?;
        *self.local_description.lock() = Some(offer.clone());
        info!(session_id = %self.session_id, "Offer created");
        Ok(offer)
    }

    /// Apply `remote_offer`, then create and apply the answer
    pub async fn create_answer(&self, remote_offer: &SessionDescription) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.begin_negotiation("create_answer")?;
        self.set_remote_description(remote_offer).await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(&answer).await?;
        *self.local_description.lock() = Some(answer.clone());
        info!(session_id = %self.session_id, "Answer created");
        Ok(answer)
    }

    /// Apply the remote description, then replay buffered candidates in
    /// arrival order. A second remote description is rejected.
    pub async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let mut remote = self.remote.lock().await;
        if remote.description_applied {
            return Err(ConsultRtcError::RenegotiationUnsupported {
                operation: "set_remote_description".to_string(),
            });
        }
        self.peer.set_remote_description(description).await?;
        remote.description_applied = true;

        let buffered = remote.pending.len();
        while let Some(candidate) = remote.pending.pop_front() {
            self.apply(&candidate).await;
        }
        info!(
            session_id = %self.session_id,
            sdp_type = %description.sdp_type,
            replayed = buffered,
            "Remote description applied"
        );
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// is set. Rejected candidates are logged and skipped.
    pub async fn apply_remote_candidate(&self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        self.ensure_open()?;
        let mut remote = self.remote.lock().await;
        if !remote.description_applied {
            remote.pending.push_back(candidate);
            debug!(session_id = %self.session_id, queued = remote.pending.len(), "Remote candidate queued");
            return Ok(CandidateDisposition::Queued);
        }
        Ok(self.apply(&candidate).await)
    }

    async fn apply(&self, candidate: &IceCandidate) -> CandidateDisposition {
        match self.peer.add_ice_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    candidate = %candidate.candidate,
                    "Skipping remote candidate: {}",
                    e
                );
                CandidateDisposition::Skipped
            }
        }
    }

    /// Candidates waiting for the remote description
    pub async fn pending_candidates(&self) -> usize {
        self.remote.lock().await.pending.len()
    }

    /// Whether the remote description has been applied
    pub async fn has_remote_description(&self) -> bool {
        self.remote.lock().await.description_applied
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    /// Record a remote track. Returns false for a track already known.
    pub fn add_remote_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self.remote_tracks.lock();
        if tracks.iter().any(|t| t.same_track(&track)) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Local tracks
    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.local_tracks.lock().clone()
    }

    /// Remote tracks observed so far
    pub fn remote_tracks(&self) -> Vec<MediaTrack> {
        self.remote_tracks.lock().clone()
    }

    /// Mute or unmute local tracks of `kind` by toggling enablement.
    /// Returns the number of tracks changed.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let tracks = self.local_tracks.lock();
        let mut changed = 0;
        for track in tracks.iter().filter(|t| t.kind() == kind) {
            if track.is_enabled() != enabled {
                track.set_enabled(enabled);
                changed += 1;
            }
        }
        changed
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop local tracks and close the connection. Only the first call
    /// does anything; returns whether this call performed the teardown.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let stopped = self
            .local_tracks
            .lock()
            .iter()
            .filter(|t| t.stop())
            .count();
        self.peer.close().await;
        self.remote.lock().await.pending.clear();
        info!(session_id = %self.session_id, stopped_tracks = stopped, "Peer connection closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedPeer {
        applied: Mutex<Vec<String>>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl PeerConnection for ScriptedPeer {
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0 answer"))
        }
        async fn set_local_description(&self, _: &SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _: &SessionDescription) -> Result<()> {
            tokio::task::yield_now().await;
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
            if candidate.candidate.contains("bogus") {
                return Err(ConsultRtcError::Negotiation {
                    reason: "malformed candidate".to_string(),
                });
            }
            self.applied.lock().push(candidate.candidate.clone());
            Ok(())
        }
        fn add_track(&self, _: &MediaTrack) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Factory(Arc<ScriptedPeer>);

    impl PeerConnectionFactory for Factory {
        fn create(
            &self,
            _: &str,
            _: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerConnection>> {
            Ok(self.0.clone())
        }
    }

    fn manager() -> (PeerConnectionManager, Arc<ScriptedPeer>) {
        let peer = Arc::new(ScriptedPeer::default());
        let (manager, _events) = PeerConnectionManager::new("s1", &Factory(peer.clone())).unwrap();
        (manager, peer)
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let (manager, peer) = manager();
        for c in ["candidate:1", "candidate:2", "candidate:3"] {
            let disposition = manager.apply_remote_candidate(IceCandidate::new(c)).await.unwrap();
            assert_eq!(disposition, CandidateDisposition::Queued);
        }
        assert!(peer.applied.lock().is_empty());
        assert_eq!(manager.pending_candidates().await, 3);

        manager
            .set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(*peer.applied.lock(), vec!["candidate:1", "candidate:2", "candidate:3"]);
        assert_eq!(manager.pending_candidates().await, 0);

        let later = manager.apply_remote_candidate(IceCandidate::new("candidate:4")).await.unwrap();
        assert_eq!(later, CandidateDisposition::Applied);
    }

    #[tokio::test]
    async fn test_bad_candidate_skipped() {
        let (manager, peer) = manager();
        manager.apply_remote_candidate(IceCandidate::new("bogus")).await.unwrap();
        manager.apply_remote_candidate(IceCandidate::new("candidate:2")).await.unwrap();
        manager
            .set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(*peer.applied.lock(), vec!["candidate:2"]);

        let skipped = manager.apply_remote_candidate(IceCandidate::new("bogus 2")).await.unwrap();
        assert_eq!(skipped, CandidateDisposition::Skipped);
    }

    #[tokio::test]
    async fn test_single_negotiation() {
        let (manager, _) = manager();
        manager.create_offer().await.unwrap();
        assert!(matches!(
            manager.create_offer().await,
            Err(ConsultRtcError::RenegotiationUnsupported { .. })
        ));
        manager
            .set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(matches!(
            manager.set_remote_description(&SessionDescription::answer("v=1")).await,
            Err(ConsultRtcError::RenegotiationUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_once_and_mute() {
        let (manager, peer) = manager();
        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        let camera = MediaTrack::new(TrackKind::Video, "camera");
        manager.add_local_track(mic.clone()).unwrap();
        manager.add_local_track(camera.clone()).unwrap();

        assert_eq!(manager.set_track_enabled(TrackKind::Audio, false), 1);
        assert!(!mic.is_enabled());
        assert!(camera.is_enabled());
        assert_eq!(manager.set_track_enabled(TrackKind::Audio, false), 0);

        let (first, second) = tokio::join!(manager.close(), manager.close());
        assert!(first ^ second);
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
        assert!(!mic.is_live());
        assert!(!camera.is_live());
        assert!(matches!(
            manager.apply_remote_candidate(IceCandidate::new("candidate:1")).await,
            Err(ConsultRtcError::PeerClosed)
        ));
    }
}
