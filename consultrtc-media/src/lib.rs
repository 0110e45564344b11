//! # ConsultRTC Media
//!
//! Media tracks, capture, compositing and chunked recording upload for
//! ConsultRTC. The recording pipeline turns a call's media into gapless,
//! retried chunk uploads that always end with a final marker.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod composite;
pub mod compositor;
pub mod error;
pub mod mixer;
pub mod pipeline;
pub mod recorder;
pub mod tracks;
pub mod upload;

// Re-export main types
pub use capture::{acquire_with_fallback, spawn_generator, MediaCapture, MediaConstraints, SyntheticCapture};
pub use composite::{CompositeConfig, CompositeOutput};
pub use compositor::{letterbox, Compositor, TileLayout, CANVAS_HEIGHT, CANVAS_WIDTH, COMPOSITE_FPS};
pub use error::{ErrorCategory, MediaError, MediaResult};
pub use mixer::{AudioMixer, MIX_INTERVAL_MS, MIX_SAMPLE_RATE};
pub use pipeline::{
    CaptureStrategy, ChunkRecord, JobStatus, PipelineConfig, RecorderFactory, RecordingHandle,
    RecordingPipeline, RecordingReport, UploadStatus,
};
pub use recorder::{FrameRecorder, MediaRecorder, FRAME_CONTAINER_MIME};
pub use tracks::{AudioFrame, MediaFrame, MediaStream, MediaTrack, TrackKind, VideoFrame};
pub use upload::{upload_with_retry, ChunkUpload, HttpUploadSink, RetryPolicy, UploadSink};
