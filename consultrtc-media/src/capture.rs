//! Local media acquisition
//!
//! [`MediaCapture`] is the seam to the platform's camera and microphone.
//! [`acquire_with_fallback`] implements the acquisition order used for calls:
//! real devices first, then a placeholder stream so the call can proceed.

use crate::error::{MediaError, MediaResult};
use crate::tracks::{AudioFrame, MediaFrame, MediaStream, MediaTrack, TrackKind, VideoFrame};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Requested capture parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,
    /// Capture video
    pub video: bool,
    /// Ideal width
    pub width: u32,
    /// Ideal height
    pub height: u32,
    /// Ideal frame rate
    pub frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Platform capability for acquiring local media
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Camera and/or microphone per `constraints`
    async fn acquire_user_media(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream>;

    /// Synthetic stream (placeholder video + silent audio) used when devices fail
    async fn acquire_placeholder(&self) -> MediaResult<MediaStream>;

    /// Microphone or system audio, used when a recording would otherwise be silent
    async fn acquire_fallback_audio(&self) -> MediaResult<MediaTrack>;
}

/// Acquire user media, falling back to a placeholder stream when allowed
pub async fn acquire_with_fallback(
    capture: &dyn MediaCapture,
    constraints: &MediaConstraints,
    allow_placeholder: bool,
) -> MediaResult<MediaStream> {
    match capture.acquire_user_media(constraints).await {
        Ok(stream) => Ok(stream),
        Err(e) if allow_placeholder => {
            warn!("User media unavailable ({}), using placeholder stream", e);
            capture.acquire_placeholder().await
        }
        Err(e) => Err(e),
    }
}

/// Capture backend producing generated frames.
///
/// Serves as the placeholder source and as a stand-in device where no
/// hardware backend is available.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    devices_available: bool,
    width: u32,
    height: u32,
    frame_rate: u32,
    sample_rate: u32,
}

impl SyntheticCapture {
    /// Backend whose "devices" succeed
    pub fn new() -> Self {
        Self {
            devices_available: true,
            width: 640,
            height: 480,
            frame_rate: 15,
            sample_rate: 48_000,
        }
    }

    /// Backend with no camera or microphone; only placeholders succeed
    pub fn without_devices() -> Self {
        Self {
            devices_available: false,
            ..Self::new()
        }
    }

    fn video_track(&self, label: &str, width: u32, height: u32, frame_rate: u32) -> MediaTrack {
        let track = MediaTrack::new(TrackKind::Video, label);
        let period = Duration::from_millis(1000 / u64::from(frame_rate.max(1)));
        spawn_generator(track.clone(), period, move |timestamp| {
            MediaFrame::Video(VideoFrame::black(width, height, timestamp))
        });
        track
    }

    fn audio_track(&self, label: &str) -> MediaTrack {
        let track = MediaTrack::new(TrackKind::Audio, label);
        let sample_rate = self.sample_rate;
        spawn_generator(track.clone(), Duration::from_millis(20), move |timestamp| {
            MediaFrame::Audio(AudioFrame::silence(sample_rate, 20, timestamp))
        });
        track
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire_user_media(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream> {
        if !self.devices_available {
            return Err(MediaError::DeviceNotFound {
                device_id: "default".to_string(),
            });
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::InvalidConfiguration {
                message: "at least one of audio or video must be requested".to_string(),
            });
        }
        let mut stream = MediaStream::new();
        if constraints.video {
            stream.add_track(self.video_track(
                "synthetic camera",
                constraints.width,
                constraints.height,
                constraints.frame_rate,
            ));
        }
        if constraints.audio {
            stream.add_track(self.audio_track("synthetic microphone"));
        }
        info!(tracks = stream.tracks().len(), "Acquired synthetic user media");
        Ok(stream)
    }

    async fn acquire_placeholder(&self) -> MediaResult<MediaStream> {
        let video = self.video_track("placeholder", self.width, self.height, self.frame_rate);
        let audio = self.audio_track("silence");
        Ok(MediaStream::with_tracks(vec![video, audio]))
    }

    async fn acquire_fallback_audio(&self) -> MediaResult<MediaTrack> {
        if !self.devices_available {
            return Err(MediaError::DeviceNotFound {
                device_id: "default audio input".to_string(),
            });
        }
        Ok(self.audio_track("fallback microphone"))
    }
}

/// Push generated frames into `track` every `period` until it stops
pub fn spawn_generator<F>(track: MediaTrack, period: Duration, mut frame: F)
where
    F: FnMut(u64) -> MediaFrame + Send + 'static,
{
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let timestamp = started.elapsed().as_millis() as u64;
            if !track.push_frame(frame(timestamp)) {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_fallback() {
        let capture = SyntheticCapture::without_devices();
        let stream = acquire_with_fallback(&capture, &MediaConstraints::default(), true)
            .await
            .unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        stream.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_placeholder_propagates_error() {
        let capture = SyntheticCapture::without_devices();
        let result = acquire_with_fallback(&capture, &MediaConstraints::default(), false).await;
        assert!(matches!(result, Err(MediaError::DeviceNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_produces_frames() {
        let capture = SyntheticCapture::new();
        let track = capture.acquire_fallback_audio().await.unwrap();
        let mut frames = track.subscribe();
        assert!(matches!(frames.recv().await.unwrap(), MediaFrame::Audio(_)));
        track.stop();
    }
}
