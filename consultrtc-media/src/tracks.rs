//! Track abstractions and media frame types
//!
//! A [`MediaTrack`] is a shared handle: the owner that acquired it controls
//! `enabled` and `stop`, readers only subscribe to frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const FRAME_CAPACITY: usize = 64;

/// Audio frame representation
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Audio samples (f32 PCM data, interleaved)
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u8,
    /// Timestamp in milliseconds
    pub timestamp: u64,
}

impl AudioFrame {
    /// Silent frame of `duration_ms` at `sample_rate`, mono
    pub fn silence(sample_rate: u32, duration_ms: u64, timestamp: u64) -> Self {
        let len = (sample_rate as u64 * duration_ms / 1000) as usize;
        Self {
            samples: vec![0.0; len],
            sample_rate,
            channels: 1,
            timestamp,
        }
    }
}

/// Video frame representation (RGBA8, row-major)
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel data, 4 bytes per pixel
    pub data: Vec<u8>,
    /// Timestamp in milliseconds
    pub timestamp: u64,
    /// Whether this is a keyframe
    pub is_keyframe: bool,
}

impl VideoFrame {
    /// Opaque black frame
    pub fn black(width: u32, height: u32, timestamp: u64) -> Self {
        let mut data = vec![0u8; (width * height * 4) as usize];
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = 255;
        }
        Self {
            width,
            height,
            data,
            timestamp,
            is_keyframe: true,
        }
    }

    /// Expected length of `data`
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Media frame types
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    /// Audio frame
    Audio(AudioFrame),
    /// Video frame
    Video(VideoFrame),
}

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    frames: broadcast::Sender<MediaFrame>,
}

/// Shared handle to one audio or video track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, label)
    }

    /// Create a track with a known id, e.g. a remote track
    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                frames,
            }),
        }
    }

    /// Get track ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Device or source label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether frames carry content (false means muted)
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute. Only the track owner should call this.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track still produces frames
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// End the track. Returns true only for the call that stopped it.
    pub fn stop(&self) -> bool {
        self.inner.live.swap(false, Ordering::SeqCst)
    }

    /// Publish a frame to subscribers.
    ///
    /// Ended tracks drop frames; disabled tracks publish silence or black.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.is_live() {
            return false;
        }
        let frame = if self.is_enabled() {
            frame
        } else {
            match frame {
                MediaFrame::Audio(mut audio) => {
                    audio.samples.iter_mut().for_each(|s| *s = 0.0);
                    MediaFrame::Audio(audio)
                }
                MediaFrame::Video(video) => MediaFrame::Video(VideoFrame::black(
                    video.width,
                    video.height,
                    video.timestamp,
                )),
            }
        };
        let _ = self.inner.frames.send(frame);
        true
    }

    /// Subscribe to frames published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    /// Whether both handles refer to the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Ordered set of tracks captured or received together
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Empty stream
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: Vec::new(),
        }
    }

    /// Stream holding `tracks`
    pub fn with_tracks(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track unless it is already present
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.same_track(&track)) {
            self.tracks.push(track);
        }
    }

    /// All tracks
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Whether any live audio track is present
    pub fn has_audio(&self) -> bool {
        self.audio_tracks().any(MediaTrack::is_live)
    }

    /// Whether the stream has no tracks
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop every track, returning how many this call stopped
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_once() {
        let track = MediaTrack::new(TrackKind::Audio, "microphone");
        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.push_frame(MediaFrame::Audio(AudioFrame::silence(48_000, 20, 0))));
    }

    #[tokio::test]
    async fn test_disabled_audio_is_silent() {
        let track = MediaTrack::new(TrackKind::Audio, "microphone");
        let mut frames = track.subscribe();
        track.set_enabled(false);
        track.push_frame(MediaFrame::Audio(AudioFrame {
            samples: vec![0.5; 4],
            sample_rate: 48_000,
            channels: 1,
            timestamp: 0,
        }));
        match frames.recv().await.unwrap() {
            MediaFrame::Audio(audio) => assert!(audio.samples.iter().all(|s| *s == 0.0)),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_stream_dedup_and_stop_all() {
        let audio = MediaTrack::new(TrackKind::Audio, "mic");
        let video = MediaTrack::new(TrackKind::Video, "camera");
        let mut stream = MediaStream::with_tracks(vec![audio.clone()]);
        stream.add_track(video);
        stream.add_track(audio.clone());
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.has_audio());

        audio.stop();
        assert!(!stream.has_audio());
        assert_eq!(stream.stop_all(), 1);
    }

    #[test]
    fn test_black_frame() {
        let frame = VideoFrame::black(2, 2, 0);
        assert_eq!(frame.data.len(), frame.expected_len());
        assert_eq!(&frame.data[0..4], &[0, 0, 0, 255]);
    }
}
