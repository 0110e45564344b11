//! Chunked stream recorder
//!
//! A [`MediaRecorder`] turns a live [`MediaStream`] into a sequence of byte
//! chunks, one per timeslice. [`FrameRecorder`] is the portable
//! implementation: it serializes raw frames into a simple length-prefixed
//! container.

use crate::error::{MediaError, MediaResult};
use crate::tracks::{MediaFrame, MediaStream};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Container mime type produced by [`FrameRecorder`]
pub const FRAME_CONTAINER_MIME: &str = "application/x-consultrtc-frames";

/// Platform recorder capability
#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Start recording `stream`, emitting one chunk per `timeslice`.
    ///
    /// The receiver closes after [`MediaRecorder::stop`] has delivered the
    /// last data.
    async fn start(
        &self,
        stream: &MediaStream,
        timeslice: Duration,
    ) -> MediaResult<mpsc::Receiver<Bytes>>;

    /// Stop recording and flush buffered data
    async fn stop(&self) -> MediaResult<()>;

    /// Mime type of the chunks
    fn mime_type(&self) -> &str;
}

struct ActiveRecording {
    stop: oneshot::Sender<()>,
    writer: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
}

/// Recorder that serializes raw frames
///
/// Each record is `kind: u8` (0 audio, 1 video), `track: u16`,
/// `timestamp: u64`, then the kind-specific header and a `u32` length
/// prefixed payload, all big-endian.
pub struct FrameRecorder {
    stop_timeout: Duration,
    active: Mutex<Option<ActiveRecording>>,
}

impl FrameRecorder {
    /// Recorder that waits up to `stop_timeout` for the final chunk
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            stop_timeout,
            active: Mutex::new(None),
        }
    }
}

impl Default for FrameRecorder {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl std::fmt::Debug for FrameRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRecorder")
            .field("stop_timeout", &self.stop_timeout)
            .field("active", &self.active.lock().is_some())
            .finish()
    }
}

fn encode_frame(buffer: &mut BytesMut, track_index: u16, frame: &MediaFrame) {
    match frame {
        MediaFrame::Audio(audio) => {
            buffer.put_u8(0);
            buffer.put_u16(track_index);
            buffer.put_u64(audio.timestamp);
            buffer.put_u32(audio.sample_rate);
            buffer.put_u8(audio.channels);
            buffer.put_u32((audio.samples.len() * 4) as u32);
            for sample in &audio.samples {
                buffer.put_f32(*sample);
            }
        }
        MediaFrame::Video(video) => {
            buffer.put_u8(1);
            buffer.put_u16(track_index);
            buffer.put_u64(video.timestamp);
            buffer.put_u32(video.width);
            buffer.put_u32(video.height);
            buffer.put_u32(video.data.len() as u32);
            buffer.put_slice(&video.data);
        }
    }
}

#[async_trait]
impl MediaRecorder for FrameRecorder {
    async fn start(
        &self,
        stream: &MediaStream,
        timeslice: Duration,
    ) -> MediaResult<mpsc::Receiver<Bytes>> {
        if timeslice.is_zero() {
            return Err(MediaError::InvalidConfiguration {
                message: "timeslice must be non-zero".to_string(),
            });
        }
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(MediaError::InvalidState {
                message: "recorder already started".to_string(),
            });
        }
        let live: Vec<_> = stream.tracks().iter().filter(|t| t.is_live()).collect();
        if live.is_empty() {
            return Err(MediaError::Recorder {
                reason: "stream has no live tracks".to_string(),
            });
        }

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(u16, MediaFrame)>();
        let mut readers = Vec::with_capacity(live.len());
        for (index, track) in live.into_iter().enumerate() {
            let mut frames = track.subscribe();
            let frame_tx = frame_tx.clone();
            let track_index = index as u16;
            readers.push(tokio::spawn(async move {
                loop {
                    match frames.recv().await {
                        Ok(frame) => {
                            if frame_tx.send((track_index, frame)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(track_index, skipped, "Recorder lagged, frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        drop(frame_tx);

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let writer = tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            let mut ticker = tokio::time::interval(timeslice);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            let chunk = buffer.split().freeze();
                            if chunk_tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                    frame = frame_rx.recv() => match frame {
                        Some((track_index, frame)) => encode_frame(&mut buffer, track_index, &frame),
                        None => break,
                    },
                }
            }
            while let Ok((track_index, frame)) = frame_rx.try_recv() {
                encode_frame(&mut buffer, track_index, &frame);
            }
            if !buffer.is_empty() {
                let _ = chunk_tx.send(buffer.freeze()).await;
            }
            debug!("Recorder writer finished");
        });

        *active = Some(ActiveRecording {
            stop: stop_tx,
            writer,
            readers,
        });
        Ok(chunk_rx)
    }

    async fn stop(&self) -> MediaResult<()> {
        let Some(recording) = self.active.lock().take() else {
            return Ok(());
        };
        for reader in &recording.readers {
            reader.abort();
        }
        let _ = recording.stop.send(());
        let mut writer = recording.writer;
        match tokio::time::timeout(self.stop_timeout, &mut writer).await {
            Ok(_) => Ok(()),
            Err(_) => {
                writer.abort();
                Err(MediaError::Timeout {
                    duration: self.stop_timeout,
                })
            }
        }
    }

    fn mime_type(&self) -> &str {
        FRAME_CONTAINER_MIME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::{AudioFrame, MediaTrack, TrackKind};

    #[tokio::test(start_paused = true)]
    async fn test_chunks_per_timeslice_and_final_flush() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let stream = MediaStream::with_tracks(vec![track.clone()]);
        let recorder = FrameRecorder::default();
        let mut chunks = recorder
            .start(&stream, Duration::from_secs(1))
            .await
            .unwrap();

        track.push_frame(MediaFrame::Audio(AudioFrame::silence(48_000, 20, 0)));
        let first = chunks.recv().await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(first[0], 0);

        track.push_frame(MediaFrame::Audio(AudioFrame::silence(48_000, 20, 20)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        recorder.stop().await.unwrap();
        assert!(chunks.recv().await.is_some());
        assert!(chunks.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_requires_live_tracks() {
        let track = MediaTrack::new(TrackKind::Video, "camera");
        track.stop();
        let recorder = FrameRecorder::default();
        let result = recorder
            .start(&MediaStream::with_tracks(vec![track]), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(MediaError::Recorder { .. })));
    }
}
