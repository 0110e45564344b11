//! Composited output stream
//!
//! Runs a [`Compositor`] and an [`AudioMixer`] over several participant
//! streams and publishes the result as one two-track [`MediaStream`].

use crate::compositor::Compositor;
use crate::error::MediaResult;
use crate::mixer::AudioMixer;
use crate::tracks::{MediaFrame, MediaStream, MediaTrack, TrackKind, VideoFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Canvas and mixer parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeConfig {
    /// Canvas width
    pub width: u32,
    /// Canvas height
    pub height: u32,
    /// Canvas frame rate
    pub frame_rate: u32,
    /// Mixer sample rate
    pub sample_rate: u32,
    /// Mixer interval
    pub mix_interval: Duration,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            width: crate::compositor::CANVAS_WIDTH,
            height: crate::compositor::CANVAS_HEIGHT,
            frame_rate: crate::compositor::COMPOSITE_FPS,
            sample_rate: crate::mixer::MIX_SAMPLE_RATE,
            mix_interval: Duration::from_millis(crate::mixer::MIX_INTERVAL_MS),
        }
    }
}

/// Running composite of several participants
pub struct CompositeOutput {
    stream: MediaStream,
    mixer: Arc<Mutex<AudioMixer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CompositeOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeOutput")
            .field("stream", &self.stream.id())
            .field("audio_inputs", &self.audio_input_count())
            .finish()
    }
}

impl CompositeOutput {
    /// Start compositing `participants`
    pub fn start(participants: &[MediaStream], config: &CompositeConfig) -> MediaResult<Self> {
        let compositor = Compositor::new(config.width, config.height, participants.len())?;
        let video_out = MediaTrack::new(TrackKind::Video, "composite video");
        let audio_out = MediaTrack::new(TrackKind::Audio, "composite audio");
        let mixer_frame_ms = config.mix_interval.as_millis() as u64;
        let mixer = Arc::new(Mutex::new(AudioMixer::new(config.sample_rate, mixer_frame_ms)));
        let latest: Arc<Mutex<Vec<Option<VideoFrame>>>> =
            Arc::new(Mutex::new(vec![None; participants.len()]));

        let mut tasks = Vec::new();
        for (slot, participant) in participants.iter().enumerate() {
            if let Some(track) = participant.video_tracks().next() {
                tasks.push(spawn_video_reader(track.clone(), slot, latest.clone()));
            }
            for track in participant.audio_tracks() {
                mixer.lock().add_input(track.id());
                tasks.push(spawn_audio_reader(track.clone(), mixer.clone()));
            }
        }

        let frame_period = Duration::from_millis(1000 / u64::from(config.frame_rate.max(1)));
        let canvas_track = video_out.clone();
        let frames = latest.clone();
        tasks.push(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(frame_period);
            loop {
                ticker.tick().await;
                let timestamp = started.elapsed().as_millis() as u64;
                let canvas = {
                    let frames = frames.lock();
                    let refs: Vec<Option<&VideoFrame>> = frames.iter().map(Option::as_ref).collect();
                    compositor.compose(&refs, timestamp)
                };
                if !canvas_track.push_frame(MediaFrame::Video(canvas)) {
                    break;
                }
            }
        }));

        let mix_track = audio_out.clone();
        let mix_source = mixer.clone();
        let mix_period = config.mix_interval;
        tasks.push(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(mix_period);
            loop {
                ticker.tick().await;
                let timestamp = started.elapsed().as_millis() as u64;
                let mixed = mix_source.lock().mix(timestamp);
                if !mix_track.push_frame(MediaFrame::Audio(mixed)) {
                    break;
                }
            }
        }));

        info!(
            participants = participants.len(),
            audio_inputs = mixer.lock().input_count(),
            "Composite started"
        );
        Ok(Self {
            stream: MediaStream::with_tracks(vec![video_out, audio_out]),
            mixer,
            tasks: Mutex::new(tasks),
        })
    }

    /// Combined output stream
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Number of audio sources feeding the mix
    pub fn audio_input_count(&self) -> usize {
        self.mixer.lock().input_count()
    }

    /// Merge another audio source into the mix
    pub fn add_audio_source(&self, track: MediaTrack) {
        if self.mixer.lock().add_input(track.id()) {
            debug!(track = %track.id(), "Audio source added to composite");
            let task = spawn_audio_reader(track, self.mixer.clone());
            self.tasks.lock().push(task);
        }
    }

    /// Stop the output tracks and all reader tasks
    pub fn stop(&self) {
        self.stream.stop_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for CompositeOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_video_reader(
    track: MediaTrack,
    slot: usize,
    latest: Arc<Mutex<Vec<Option<VideoFrame>>>>,
) -> JoinHandle<()> {
    let mut frames = track.subscribe();
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(MediaFrame::Video(frame)) => latest.lock()[slot] = Some(frame),
                Ok(MediaFrame::Audio(_)) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_audio_reader(track: MediaTrack, mixer: Arc<Mutex<AudioMixer>>) -> JoinHandle<()> {
    let mut frames = track.subscribe();
    let source_id = track.id().to_string();
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(MediaFrame::Audio(frame)) => {
                    mixer.lock().push(&source_id, &frame);
                }
                Ok(MediaFrame::Video(_)) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::AudioFrame;

    fn participant(with_audio: bool) -> MediaStream {
        let mut stream = MediaStream::new();
        stream.add_track(MediaTrack::new(TrackKind::Video, "camera"));
        if with_audio {
            stream.add_track(MediaTrack::new(TrackKind::Audio, "mic"));
        }
        stream
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_has_both_tracks() {
        let participants = vec![participant(true), participant(false)];
        let composite = CompositeOutput::start(&participants, &CompositeConfig::default()).unwrap();
        assert_eq!(composite.stream().video_tracks().count(), 1);
        assert_eq!(composite.stream().audio_tracks().count(), 1);
        assert_eq!(composite.audio_input_count(), 1);

        let mut canvas = composite.stream().video_tracks().next().unwrap().subscribe();
        match canvas.recv().await.unwrap() {
            MediaFrame::Video(frame) => assert_eq!((frame.width, frame.height), (1280, 720)),
            other => panic!("unexpected frame: {:?}", other),
        }
        composite.stop();
        assert!(!composite.stream().has_audio());
    }

    #[tokio::test(start_paused = true)]
    async fn test_added_source_reaches_mix() {
        let composite =
            CompositeOutput::start(&[participant(false)], &CompositeConfig::default()).unwrap();
        assert_eq!(composite.audio_input_count(), 0);

        let fallback = MediaTrack::new(TrackKind::Audio, "fallback");
        composite.add_audio_source(fallback.clone());
        composite.add_audio_source(fallback.clone());
        assert_eq!(composite.audio_input_count(), 1);

        let mut mixed = composite.stream().audio_tracks().next().unwrap().subscribe();
        tokio::task::yield_now().await;
        fallback.push_frame(MediaFrame::Audio(AudioFrame {
            samples: vec![0.25; 960],
            sample_rate: 48_000,
            channels: 1,
            timestamp: 0,
        }));
        let mut heard = false;
        for _ in 0..5 {
            if let MediaFrame::Audio(frame) = mixed.recv().await.unwrap() {
                if frame.samples.iter().any(|s| *s > 0.2) {
                    heard = true;
                    break;
                }
            }
        }
        assert!(heard);
    }
}
