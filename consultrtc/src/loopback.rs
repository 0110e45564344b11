//! In-process peer connections
//!
//! Peers created from the same [`LoopbackNetwork`] find each other through
//! the session token carried in the `o=` line of their descriptions. Once
//! both sides have applied a local and a remote description, each side
//! receives the other's local tracks as remote tracks. Used for local
//! deployments without a media stack and for end-to-end tests.

use crate::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use async_trait::async_trait;
use consultrtc_core::{ConsultRtcError, IceCandidate, Result, SessionDescription};
use consultrtc_media::{MediaTrack, TrackKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
struct NetworkInner {
    peers: DashMap<String, Arc<LoopbackPeer>>,
    next_port: AtomicU16,
}

/// Registry of in-process peers
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers currently open
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }
}

impl PeerConnectionFactory for LoopbackNetwork {
    fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let port = 50_000 + self.inner.next_port.fetch_add(1, Ordering::Relaxed) % 10_000;
        let peer = Arc::new(LoopbackPeer {
            token: token.clone(),
            session_id: session_id.to_string(),
            port,
            network: Arc::downgrade(&self.inner),
            events,
            state: Mutex::new(PeerState::default()),
            connected: AtomicBool::new(false),
        });
        self.inner.peers.insert(token, peer.clone());
        Ok(peer)
    }
}

#[derive(Debug)]
struct PeerState {
    local_tracks: Vec<MediaTrack>,
    local_applied: bool,
    remote_token: Option<String>,
    applied_candidates: usize,
    current: PeerConnectionState,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            local_tracks: Vec::new(),
            local_applied: false,
            remote_token: None,
            applied_candidates: 0,
            current: PeerConnectionState::New,
        }
    }
}

#[derive(Debug)]
struct LoopbackPeer {
    token: String,
    session_id: String,
    port: u16,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
    connected: AtomicBool,
}

fn session_token(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find(|line| line.starts_with("o="))
        .and_then(|line| line.split_whitespace().nth(1))
}

impl LoopbackPeer {
    fn describe(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.token
        );
        for track in &self.state.lock().local_tracks {
            let media = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={} {} UDP/TLS/RTP/SAVPF 96\r\na=msid:- {}\r\n",
                media,
                self.port,
                track.id()
            ));
        }
        sdp
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().current == PeerConnectionState::Closed {
            return Err(ConsultRtcError::PeerClosed);
        }
        Ok(())
    }

    fn set_state(&self, state: PeerConnectionState) {
        let changed = {
            let mut current = self.state.lock();
            let changed = current.current != state;
            current.current = state;
            changed
        };
        if changed {
            let _ = self.events.send(PeerEvent::StateChanged(state));
        }
    }

    fn ready(&self) -> Option<String> {
        let state = self.state.lock();
        if state.local_applied && state.current != PeerConnectionState::Closed {
            state.remote_token.clone()
        } else {
            None
        }
    }

    fn try_connect(&self) {
        let Some(remote_token) = self.ready() else {
            return;
        };
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let (Some(this), Some(remote)) = (
            network.peers.get(&self.token).map(|p| p.value().clone()),
            network.peers.get(&remote_token).map(|p| p.value().clone()),
        ) else {
            return;
        };
        if remote.ready().as_deref() != Some(self.token.as_str()) {
            return;
        }

        // The peer with the smaller token owns the connect flag
        let owner = if this.token < remote.token { &this } else { &remote };
        if owner.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        for (from, to) in [(&this, &remote), (&remote, &this)] {
            let tracks = from.state.lock().local_tracks.clone();
            for track in tracks {
                let _ = to.events.send(PeerEvent::RemoteTrack(track));
            }
            to.set_state(PeerConnectionState::Connected);
        }
        debug!(a = %this.session_id, b = %remote.session_id, "Loopback peers connected");
    }

    fn gather(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                self.port
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some(self.token[..8].to_string()),
        };
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.describe()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.state.lock().remote_token.is_none() {
            return Err(ConsultRtcError::Negotiation {
                reason: "cannot answer before a remote offer is applied".to_string(),
            });
        }
        Ok(SessionDescription::answer(self.describe()))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if session_token(&description.sdp) != Some(self.token.as_str()) {
            return Err(ConsultRtcError::Negotiation {
                reason: "local description was not created by this peer".to_string(),
            });
        }
        self.state.lock().local_applied = true;
        self.set_state(PeerConnectionState::Connecting);
        self.gather();
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let token = session_token(&description.sdp).ok_or_else(|| ConsultRtcError::Negotiation {
            reason: "remote description has no origin line".to_string(),
        })?;
        self.state.lock().remote_token = Some(token.to_string());
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if candidate.is_end_of_candidates() {
            return Ok(());
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(ConsultRtcError::Negotiation {
                reason: format!("malformed candidate {:?}", candidate.candidate),
            });
        }
        let applied = {
            let mut state = self.state.lock();
            state.applied_candidates += 1;
            state.applied_candidates
        };
        debug!(session_id = %self.session_id, applied, "Loopback candidate applied");
        Ok(())
    }

    fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().local_tracks.push(track.clone());
        Ok(())
    }

    async fn close(&self) {
        if self.ensure_open().is_err() {
            return;
        }
        let remote_token = self.state.lock().remote_token.clone();
        self.set_state(PeerConnectionState::Closed);
        if let Some(network) = self.network.upgrade() {
            network.peers.remove(&self.token);
            if let Some(remote) = remote_token.and_then(|t| network.peers.get(&t).map(|p| p.value().clone())) {
                remote.set_state(PeerConnectionState::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_pair_exchanges_tracks() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.create("a", a_tx).unwrap();
        let b = network.create("b", b_tx).unwrap();

        let mic = MediaTrack::new(TrackKind::Audio, "a mic");
        a.add_track(&mic).unwrap();
        let camera = MediaTrack::new(TrackKind::Video, "b camera");
        b.add_track(&camera).unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(&offer).await.unwrap();
        b.set_remote_description(&offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(&answer).await.unwrap();
        assert!(drain(&mut a_rx)
            .iter()
            .all(|e| !matches!(e, PeerEvent::RemoteTrack(_))));

        a.set_remote_description(&answer).await.unwrap();
        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        assert!(a_events
            .iter()
            .any(|e| matches!(e, PeerEvent::RemoteTrack(t) if t.same_track(&camera))));
        assert!(b_events
            .iter()
            .any(|e| matches!(e, PeerEvent::RemoteTrack(t) if t.same_track(&mic))));
        assert!(b_events
            .iter()
            .any(|e| matches!(e, PeerEvent::LocalCandidate(_))));

        a.close().await;
        assert_eq!(network.peer_count(), 1);
        assert!(drain(&mut b_rx)
            .iter()
            .any(|e| matches!(e, PeerEvent::StateChanged(PeerConnectionState::Disconnected))));
    }

    #[tokio::test]
    async fn test_malformed_candidate_rejected() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = network.create("a", tx).unwrap();
        assert!(peer.add_ice_candidate(&IceCandidate::new("garbage")).await.is_err());
        assert!(peer.add_ice_candidate(&IceCandidate::new("")).await.is_ok());
        assert!(peer
            .add_ice_candidate(&IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"))
            .await
            .is_ok());
    }
}
