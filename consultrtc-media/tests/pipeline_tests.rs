//! Recording pipeline tests
//!
//! Drives recording jobs end to end with the frame recorder and an
//! in-memory upload sink.

use async_trait::async_trait;
use consultrtc_media::{
    spawn_generator, AudioFrame, CaptureStrategy, ChunkUpload, CompositeConfig, Compositor,
    JobStatus, MediaCapture, MediaConstraints, MediaError, MediaFrame, MediaResult, MediaStream,
    MediaTrack, PipelineConfig, RecordingPipeline, RetryPolicy, SyntheticCapture, TrackKind,
    UploadSink, UploadStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct MemorySink {
    accepted: Mutex<Vec<ChunkUpload>>,
    failures: Mutex<HashMap<u64, u32>>,
    always_fail: AtomicBool,
}

impl MemorySink {
    fn fail_index(&self, index: u64, times: u32) {
        self.failures.lock().insert(index, times);
    }

    fn accepted(&self) -> Vec<ChunkUpload> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl UploadSink for MemorySink {
    async fn upload(&self, chunk: &ChunkUpload) -> MediaResult<()> {
        let injected = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&chunk.index) {
                Some(left) if *left > 0 && !chunk.is_final => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if injected || self.always_fail.load(Ordering::SeqCst) {
            return Err(MediaError::Upload {
                index: chunk.index,
                is_final: chunk.is_final,
                reason: "HTTP 503".to_string(),
            });
        }
        self.accepted.lock().push(chunk.clone());
        Ok(())
    }
}

struct CountingCapture {
    inner: SyntheticCapture,
    fallback_requests: AtomicUsize,
    microphone_missing: bool,
}

impl CountingCapture {
    fn new(microphone_missing: bool) -> Self {
        Self {
            inner: SyntheticCapture::new(),
            fallback_requests: AtomicUsize::new(0),
            microphone_missing,
        }
    }
}

#[async_trait]
impl MediaCapture for CountingCapture {
    async fn acquire_user_media(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream> {
        self.inner.acquire_user_media(constraints).await
    }

    async fn acquire_placeholder(&self) -> MediaResult<MediaStream> {
        self.inner.acquire_placeholder().await
    }

    async fn acquire_fallback_audio(&self) -> MediaResult<MediaTrack> {
        self.fallback_requests.fetch_add(1, Ordering::SeqCst);
        if self.microphone_missing {
            return Err(MediaError::DeviceNotFound {
                device_id: "microphone".to_string(),
            });
        }
        self.inner.acquire_fallback_audio().await
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        timeslice: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        },
        audio_grace: Duration::from_secs(3),
        composite: CompositeConfig {
            width: 32,
            height: 18,
            frame_rate: 5,
            sample_rate: 8_000,
            mix_interval: Duration::from_millis(20),
        },
    }
}

fn pipeline(sink: Arc<MemorySink>) -> RecordingPipeline {
    RecordingPipeline::new(sink, Arc::new(SyntheticCapture::new()), fast_config())
}

fn live_microphone() -> MediaTrack {
    let track = MediaTrack::new(TrackKind::Audio, "mic");
    spawn_generator(track.clone(), Duration::from_millis(20), |timestamp| {
        MediaFrame::Audio(AudioFrame::silence(8_000, 20, timestamp))
    });
    track
}

#[tokio::test(start_paused = true)]
async fn test_media_failure_sends_one_empty_marker() {
    let sink = Arc::new(MemorySink::default());
    let handle = pipeline(sink.clone()).arm("room-1", "doctor1");

    let dead = MediaTrack::new(TrackKind::Audio, "mic");
    dead.stop();
    handle
        .start(CaptureStrategy::Direct {
            stream: MediaStream::with_tracks(vec![dead]),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status(), JobStatus::Armed);

    handle.flush();
    handle.flush();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.status, JobStatus::CompleteEmpty);
    assert_eq!(report.bytes_captured, 0);
    let accepted = sink.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].index, 0);
    assert!(accepted[0].is_final);
    assert!(accepted[0].payload.is_empty());
    assert_eq!(accepted[0].room_id, "room-1");
}

#[tokio::test(start_paused = true)]
async fn test_flush_without_start_sends_empty_marker() {
    let sink = Arc::new(MemorySink::default());
    let handle = pipeline(sink.clone()).arm("room-2", "patient1");
    handle.flush();
    let report = assert_ok!(handle.wait().await);

    assert_eq!(report.status, JobStatus::CompleteEmpty);
    assert_eq!(sink.accepted().len(), 1);
    assert_err!(handle.start(CaptureStrategy::Direct {
        stream: MediaStream::new()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_flushes() {
    let sink = Arc::new(MemorySink::default());
    let handle = pipeline(sink.clone()).arm("room-3", "patient1");
    drop(handle);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let accepted = sink.accepted();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].is_final);
}

#[tokio::test(start_paused = true)]
async fn test_chunks_are_gapless_and_last_is_final() {
    let sink = Arc::new(MemorySink::default());
    let handle = pipeline(sink.clone()).arm("room-4", "doctor1");
    let mic = live_microphone();
    handle
        .start(CaptureStrategy::Direct {
            stream: MediaStream::with_tracks(vec![mic.clone()]),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(handle.status(), JobStatus::Recording);

    handle.flush();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, JobStatus::Complete);
    assert!(mic.is_live());

    let accepted = sink.accepted();
    assert!(accepted.len() >= 3);
    let mut indices: Vec<u64> = accepted.iter().map(|c| c.index).collect();
    indices.sort_unstable();
    let expected: Vec<u64> = (0..accepted.len() as u64).collect();
    assert_eq!(indices, expected);

    let last = accepted.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.index, accepted.len() as u64 - 1);
    assert_eq!(accepted.iter().filter(|c| c.is_final).count(), 1);
    assert!(accepted.iter().all(|c| !c.payload.is_empty()));

    let total: u64 = accepted.iter().map(|c| c.payload.len() as u64).sum();
    assert_eq!(total, report.bytes_captured);
    assert_eq!(report.final_chunk().map(|c| c.index), Some(last.index));
}

#[tokio::test(start_paused = true)]
async fn test_failed_chunk_retried_on_flush() {
    let sink = Arc::new(MemorySink::default());
    sink.fail_index(1, 2);
    let handle = pipeline(sink.clone()).arm("room-5", "doctor1");
    handle
        .start(CaptureStrategy::Direct {
            stream: MediaStream::with_tracks(vec![live_microphone()]),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    handle.flush();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.status, JobStatus::Complete);
    let chunk = report.chunks.iter().find(|c| c.index == 1).unwrap();
    assert_eq!(chunk.status, UploadStatus::Uploaded);
    assert_eq!(chunk.attempts, 3);
    assert!(sink.accepted().iter().any(|c| c.index == 1));
}

#[tokio::test(start_paused = true)]
async fn test_final_upload_failure_fails_job() {
    let sink = Arc::new(MemorySink::default());
    sink.always_fail.store(true, Ordering::SeqCst);
    let handle = pipeline(sink.clone()).arm("room-6", "doctor1");
    handle.flush();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.is_some());
    let marker = report.final_chunk().unwrap();
    assert_eq!(marker.status, UploadStatus::Failed);
    assert_eq!(marker.attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn test_silent_composite_acquires_fallback_audio() {
    let sink = Arc::new(MemorySink::default());
    let capture = Arc::new(CountingCapture::new(false));
    let pipeline = RecordingPipeline::new(sink.clone(), capture.clone(), fast_config());
    let handle = pipeline.arm("room-7", "doctor1");

    let participants = vec![
        MediaStream::with_tracks(vec![MediaTrack::new(TrackKind::Video, "camera a")]),
        MediaStream::with_tracks(vec![MediaTrack::new(TrackKind::Video, "camera b")]),
    ];
    handle
        .start(CaptureStrategy::Composited { participants })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(capture.fallback_requests.load(Ordering::SeqCst), 1);

    handle.flush();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, JobStatus::Complete);
    assert!(report.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_fallback_audio_is_reported() {
    let sink = Arc::new(MemorySink::default());
    let capture = Arc::new(CountingCapture::new(true));
    let pipeline = RecordingPipeline::new(sink.clone(), capture.clone(), fast_config());
    let handle = pipeline.arm("room-9", "doctor1");

    let participants = vec![MediaStream::with_tracks(vec![MediaTrack::new(
        TrackKind::Video,
        "camera",
    )])];
    handle
        .start(CaptureStrategy::Composited { participants })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(capture.fallback_requests.load(Ordering::SeqCst), 1);

    handle.flush();
    let report = handle.wait().await.unwrap();
    let error = report.error.expect("audio failure reported");
    assert!(error.contains("could not capture any audio"));
    assert!(error.contains("microphone"));
    assert!(sink.accepted().iter().any(|chunk| chunk.is_final));
}

#[tokio::test(start_paused = true)]
async fn test_composite_with_audio_skips_fallback() {
    let sink = Arc::new(MemorySink::default());
    let capture = Arc::new(CountingCapture::new(false));
    let pipeline = RecordingPipeline::new(sink.clone(), capture.clone(), fast_config());
    let handle = pipeline.arm("room-8", "doctor1");

    let participants = vec![MediaStream::with_tracks(vec![
        MediaTrack::new(TrackKind::Video, "camera"),
        live_microphone(),
    ])];
    handle
        .start(CaptureStrategy::Composited { participants })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    handle.flush();
    handle.wait().await.unwrap();

    assert_eq!(capture.fallback_requests.load(Ordering::SeqCst), 0);
}

#[test]
fn test_five_participants_use_three_by_three_grid() {
    let compositor = Compositor::new(1280, 720, 5).unwrap();
    let layout = compositor.layout();
    assert_eq!((layout.columns, layout.rows), (3, 3));
    assert_eq!(layout.capacity(), 9);
}
