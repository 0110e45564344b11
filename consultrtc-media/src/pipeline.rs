//! Recording pipeline
//!
//! One job per call session. The job is armed when the call starts, begins
//! recording once media is available and always ends with a final upload:
//! the last chunk marked `isFinal`, or an empty marker when nothing was
//! captured.
//!
//! Chunks are numbered from 0 without gaps. The newest chunk is held back
//! until the next one arrives (or the job flushes) so that the final flag
//! lands on the last chunk, which is uploaded only after every earlier
//! chunk has settled.

use crate::capture::MediaCapture;
use crate::composite::{CompositeConfig, CompositeOutput};
use crate::error::{MediaError, MediaResult};
use crate::recorder::{FrameRecorder, MediaRecorder};
use crate::tracks::{MediaStream, MediaTrack};
use crate::upload::{upload_with_retry, ChunkUpload, RetryPolicy, UploadSink};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What to record
#[derive(Debug, Clone)]
pub enum CaptureStrategy {
    /// Record one combined stream as is
    Direct {
        /// Local and remote tracks of a two-party call
        stream: MediaStream,
    },
    /// Tile video and mix audio of several participants first
    Composited {
        /// One stream per participant
        participants: Vec<MediaStream>,
    },
}

/// Overall job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobStatus {
    /// Waiting for media
    Armed,
    /// Recorder running
    Recording,
    /// Stopping the recorder and settling uploads
    Flushing,
    /// Final chunk acknowledged
    Complete,
    /// Empty final marker acknowledged
    CompleteEmpty,
    /// Final chunk or marker could not be delivered
    Failed,
}

impl JobStatus {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::CompleteEmpty | JobStatus::Failed
        )
    }
}

/// Upload state of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UploadStatus {
    /// Held or queued
    Pending,
    /// In flight
    Uploading,
    /// Acknowledged
    Uploaded,
    /// Retries exhausted
    Failed,
}

/// Bookkeeping for one chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    /// Chunk index
    pub index: u64,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// Payload size in bytes
    pub size: usize,
    /// Whether this was the final upload
    pub is_final: bool,
    /// Upload state
    pub status: UploadStatus,
    /// Upload attempts made
    pub attempts: u32,
}

/// Outcome of a finished job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingReport {
    /// Room the recording belongs to
    pub room_id: String,
    /// Uploading user
    pub user_id: String,
    /// Terminal status
    pub status: JobStatus,
    /// Every chunk, by index
    pub chunks: Vec<ChunkRecord>,
    /// Bytes produced by the recorder
    pub bytes_captured: u64,
    /// Last upload or audio capture error, if any
    pub error: Option<String>,
}

impl RecordingReport {
    /// The chunk carrying the final flag
    pub fn final_chunk(&self) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.is_final)
    }
}

/// Pipeline parameters
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Recorder timeslice (chunk duration)
    pub timeslice: Duration,
    /// Per-chunk retry policy
    pub retry: RetryPolicy,
    /// How long a composited recording may run without audio before the
    /// fallback source is acquired
    pub audio_grace: Duration,
    /// Canvas and mixer parameters
    pub composite: CompositeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeslice: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            audio_grace: Duration::from_secs(3),
            composite: CompositeConfig::default(),
        }
    }
}

/// Creates one recorder per job
pub type RecorderFactory = Arc<dyn Fn() -> Arc<dyn MediaRecorder> + Send + Sync>;

/// Factory for recording jobs
#[derive(Clone)]
pub struct RecordingPipeline {
    sink: Arc<dyn UploadSink>,
    capture: Arc<dyn MediaCapture>,
    recorders: RecorderFactory,
    config: PipelineConfig,
}

impl std::fmt::Debug for RecordingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingPipeline")
            .field("config", &self.config)
            .finish()
    }
}

impl RecordingPipeline {
    /// Pipeline uploading to `sink`, acquiring fallback audio from `capture`
    pub fn new(
        sink: Arc<dyn UploadSink>,
        capture: Arc<dyn MediaCapture>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sink,
            capture,
            recorders: Arc::new(|| Arc::new(FrameRecorder::default()) as Arc<dyn MediaRecorder>),
            config,
        }
    }

    /// Use a different recorder implementation
    pub fn with_recorder_factory(mut self, recorders: RecorderFactory) -> Self {
        self.recorders = recorders;
        self
    }

    /// Pipeline parameters
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Arm a job for `room_id`. The job flushes when told to, or when every
    /// handle is dropped.
    pub fn arm(&self, room_id: impl Into<String>, user_id: impl Into<String>) -> RecordingHandle {
        let room_id = room_id.into();
        let user_id = user_id.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(JobStatus::Armed);
        let (report_tx, report_rx) = watch::channel(None);

        let recorder = (self.recorders)();
        let job = Job {
            room_id: room_id.clone(),
            user_id,
            mime_type: recorder.mime_type().to_string(),
            recorder,
            sink: self.sink.clone(),
            capture: self.capture.clone(),
            config: self.config.clone(),
            status: status_tx,
            chunks: Vec::new(),
            unacked: HashMap::new(),
            held: None,
            next_index: 0,
            bytes_captured: 0,
            last_error: None,
            uploads: JoinSet::new(),
            composite: None,
            owned_tracks: Vec::new(),
            incoming: None,
            audio_check: None,
        };

        tokio::spawn(async move {
            let report = job.run(commands_rx).await;
            let _ = report_tx.send(Some(report));
        });

        debug!(room_id = %room_id, "Recording job armed");
        RecordingHandle {
            room_id,
            commands: commands_tx,
            status: status_rx,
            report: report_rx,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start(CaptureStrategy),
    Flush,
}

/// Control handle of one recording job
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    room_id: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<JobStatus>,
    report: watch::Receiver<Option<RecordingReport>>,
}

impl RecordingHandle {
    /// Room id
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Begin recording. Only the first start of a job takes effect.
    pub fn start(&self, strategy: CaptureStrategy) -> MediaResult<()> {
        self.commands
            .send(Command::Start(strategy))
            .map_err(|_| MediaError::InvalidState {
                message: format!("recording job {} already finished", self.room_id),
            })
    }

    /// Stop recording and deliver the final upload. Idempotent.
    pub fn flush(&self) {
        let _ = self.commands.send(Command::Flush);
    }

    /// Current status
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    pub fn status_watch(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    /// Wait for the job to finish
    pub async fn wait(&self) -> MediaResult<RecordingReport> {
        let mut report = self.report.clone();
        let done = report
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MediaError::InvalidState {
                message: format!("recording job {} aborted", self.room_id),
            })?;
        done.clone().ok_or_else(|| MediaError::InvalidState {
            message: format!("recording job {} produced no report", self.room_id),
        })
    }
}

struct Job {
    room_id: String,
    user_id: String,
    mime_type: String,
    recorder: Arc<dyn MediaRecorder>,
    sink: Arc<dyn UploadSink>,
    capture: Arc<dyn MediaCapture>,
    config: PipelineConfig,
    status: watch::Sender<JobStatus>,
    chunks: Vec<ChunkRecord>,
    unacked: HashMap<u64, ChunkUpload>,
    held: Option<ChunkUpload>,
    next_index: u64,
    bytes_captured: u64,
    last_error: Option<String>,
    uploads: JoinSet<(u64, MediaResult<u32>)>,
    composite: Option<CompositeOutput>,
    owned_tracks: Vec<MediaTrack>,
    incoming: Option<mpsc::Receiver<Bytes>>,
    audio_check: Option<Instant>,
}

async fn next_chunk(incoming: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Job {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> RecordingReport {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(strategy)) => self.start(strategy).await,
                    Some(Command::Flush) | None => break,
                },
                chunk = next_chunk(&mut self.incoming) => match chunk {
                    Some(bytes) => self.accept(bytes),
                    None => {
                        warn!(room_id = %self.room_id, "Recorder ended before flush");
                        self.incoming = None;
                    }
                },
                Some(joined) = self.uploads.join_next(), if !self.uploads.is_empty() => {
                    self.settle(joined);
                }
                _ = deadline(self.audio_check) => {
                    self.audio_check = None;
                    self.ensure_audio().await;
                }
            }
        }
        self.flush().await
    }

    fn set_status(&self, status: JobStatus) {
        self.status.send_replace(status);
    }

    async fn start(&mut self, strategy: CaptureStrategy) {
        if *self.status.borrow() != JobStatus::Armed || self.incoming.is_some() {
            warn!(room_id = %self.room_id, "Recording already started, ignoring start");
            return;
        }

        let stream = match strategy {
            CaptureStrategy::Direct { stream } => stream,
            CaptureStrategy::Composited { participants } => {
                match CompositeOutput::start(&participants, &self.config.composite) {
                    Ok(composite) => {
                        let stream = composite.stream().clone();
                        self.composite = Some(composite);
                        self.audio_check = Some(Instant::now() + self.config.audio_grace);
                        stream
                    }
                    Err(e) => {
                        error!(room_id = %self.room_id, "Composite failed to start: {}", e);
                        return;
                    }
                }
            }
        };

        match self.recorder.start(&stream, self.config.timeslice).await {
            Ok(incoming) => {
                self.incoming = Some(incoming);
                self.set_status(JobStatus::Recording);
                info!(
                    room_id = %self.room_id,
                    tracks = stream.tracks().len(),
                    "Recording started"
                );
            }
            Err(e) => {
                error!(room_id = %self.room_id, "Recorder failed to start: {}", e);
                if let Some(composite) = self.composite.take() {
                    composite.stop();
                }
                self.audio_check = None;
            }
        }
    }

    async fn ensure_audio(&mut self) {
        let Some(composite) = &self.composite else {
            return;
        };
        if composite.audio_input_count() > 0 {
            return;
        }
        match self.capture.acquire_fallback_audio().await {
            Ok(track) => {
                composite.add_audio_source(track.clone());
                self.owned_tracks.push(track);
                info!(room_id = %self.room_id, "Fallback audio merged into recording");
            }
            Err(e) => {
                error!(room_id = %self.room_id, "Could not capture any audio: {}", e);
                self.last_error = Some(format!("could not capture any audio: {}", e));
            }
        }
    }

    fn accept(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.bytes_captured += payload.len() as u64;
        let chunk = ChunkUpload {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            index: self.next_index,
            captured_at: Utc::now(),
            is_final: false,
            mime_type: self.mime_type.clone(),
            payload,
        };
        self.next_index += 1;
        self.chunks.push(ChunkRecord {
            index: chunk.index,
            captured_at: chunk.captured_at,
            size: chunk.payload.len(),
            is_final: false,
            status: UploadStatus::Pending,
            attempts: 0,
        });
        debug!(room_id = %self.room_id, index = chunk.index, size = chunk.payload.len(), "Chunk captured");

        if let Some(previous) = self.held.replace(chunk) {
            self.spawn_upload(previous);
        }
    }

    fn record_mut(&mut self, index: u64) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.index == index)
    }

    fn spawn_upload(&mut self, chunk: ChunkUpload) {
        let index = chunk.index;
        if let Some(record) = self.record_mut(index) {
            record.status = UploadStatus::Uploading;
        }
        self.unacked.insert(index, chunk.clone());
        let sink = self.sink.clone();
        let policy = self.config.retry.clone();
        self.uploads.spawn(async move {
            let result = upload_with_retry(sink.as_ref(), &chunk, &policy).await;
            (index, result)
        });
    }

    fn settle(&mut self, joined: Result<(u64, MediaResult<u32>), tokio::task::JoinError>) {
        match joined {
            Ok((index, Ok(attempts))) => {
                self.unacked.remove(&index);
                if let Some(record) = self.record_mut(index) {
                    record.status = UploadStatus::Uploaded;
                    record.attempts += attempts;
                }
            }
            Ok((index, Err(e))) => {
                let attempts = self.config.retry.max_attempts.max(1);
                if let Some(record) = self.record_mut(index) {
                    record.status = UploadStatus::Failed;
                    record.attempts += attempts;
                }
                warn!(room_id = %self.room_id, index, "Chunk upload gave up: {}", e);
                self.last_error = Some(e.to_string());
            }
            Err(e) => {
                error!(room_id = %self.room_id, "Upload task failed: {}", e);
            }
        }
    }

    async fn drain_uploads(&mut self) {
        while let Some(joined) = self.uploads.join_next().await {
            self.settle(joined);
        }
    }

    async fn flush(mut self) -> RecordingReport {
        self.set_status(JobStatus::Flushing);
        self.audio_check = None;

        if let Some(mut incoming) = self.incoming.take() {
            let recorder = self.recorder.clone();
            let mut tail = Vec::new();
            let (stopped, ()) = tokio::join!(recorder.stop(), async {
                while let Some(bytes) = incoming.recv().await {
                    tail.push(bytes);
                }
            });
            if let Err(e) = stopped {
                warn!(room_id = %self.room_id, "Recorder stop: {}", e);
            }
            for bytes in tail {
                self.accept(bytes);
            }
        }
        if let Some(composite) = self.composite.take() {
            composite.stop();
        }
        for track in self.owned_tracks.drain(..) {
            track.stop();
        }

        self.drain_uploads().await;

        // One more round with a fresh retry budget
        let mut failed: Vec<u64> = self.unacked.keys().copied().collect();
        failed.sort_unstable();
        for index in failed {
            if let Some(chunk) = self.unacked.get(&index).cloned() {
                self.spawn_upload(chunk);
            }
        }
        self.drain_uploads().await;

        let status = match self.held.take() {
            Some(mut last) => {
                last.is_final = true;
                if let Some(record) = self.record_mut(last.index) {
                    record.is_final = true;
                }
                if self.upload_final(last).await {
                    JobStatus::Complete
                } else {
                    JobStatus::Failed
                }
            }
            None => {
                let marker = ChunkUpload {
                    room_id: self.room_id.clone(),
                    user_id: self.user_id.clone(),
                    index: self.next_index,
                    captured_at: Utc::now(),
                    is_final: true,
                    mime_type: self.mime_type.clone(),
                    payload: Bytes::new(),
                };
                self.chunks.push(ChunkRecord {
                    index: marker.index,
                    captured_at: marker.captured_at,
                    size: 0,
                    is_final: true,
                    status: UploadStatus::Pending,
                    attempts: 0,
                });
                info!(room_id = %self.room_id, "Nothing captured, sending empty final marker");
                if self.upload_final(marker).await {
                    JobStatus::CompleteEmpty
                } else {
                    JobStatus::Failed
                }
            }
        };

        self.set_status(status);
        info!(
            room_id = %self.room_id,
            status = ?status,
            chunks = self.chunks.len(),
            bytes = self.bytes_captured,
            "Recording finished"
        );
        RecordingReport {
            room_id: self.room_id,
            user_id: self.user_id,
            status,
            chunks: self.chunks,
            bytes_captured: self.bytes_captured,
            error: self.last_error,
        }
    }

    async fn upload_final(&mut self, chunk: ChunkUpload) -> bool {
        let index = chunk.index;
        if let Some(record) = self.record_mut(index) {
            record.status = UploadStatus::Uploading;
        }
        for round in 0..2 {
            let result = upload_with_retry(self.sink.as_ref(), &chunk, &self.config.retry).await;
            match result {
                Ok(attempts) => {
                    if let Some(record) = self.record_mut(index) {
                        record.status = UploadStatus::Uploaded;
                        record.attempts += attempts;
                    }
                    return true;
                }
                Err(e) => {
                    let attempts = self.config.retry.max_attempts.max(1);
                    if let Some(record) = self.record_mut(index) {
                        record.attempts += attempts;
                    }
                    warn!(room_id = %self.room_id, index, round, "Final upload failed: {}", e);
                    self.last_error = Some(e.to_string());
                }
            }
        }
        if let Some(record) = self.record_mut(index) {
            record.status = UploadStatus::Failed;
        }
        false
    }
}
