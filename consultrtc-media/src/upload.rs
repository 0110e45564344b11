//! Recording upload
//!
//! Chunks are posted as multipart forms to the recording endpoint. Each
//! chunk retries independently with exponential backoff.

use crate::error::{MediaError, MediaResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::{debug, warn};

/// One upload request
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkUpload {
    /// Room (call session) the recording belongs to
    pub room_id: String,
    /// Uploading user
    pub user_id: String,
    /// Gapless chunk index starting at 0
    pub index: u64,
    /// When the recorder produced the chunk
    pub captured_at: DateTime<Utc>,
    /// Last upload of the job
    pub is_final: bool,
    /// Container mime type
    pub mime_type: String,
    /// Chunk bytes, empty for the empty final marker
    pub payload: Bytes,
}

impl ChunkUpload {
    /// File name sent with the `file` part
    pub fn file_name(&self) -> String {
        let extension = if self.mime_type.contains("webm") {
            "webm"
        } else {
            "bin"
        };
        format!(
            "recording_{}_{}_{}.{}",
            self.room_id,
            self.captured_at.timestamp_millis(),
            self.index,
            extension
        )
    }
}

/// Destination of recording chunks
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Upload one chunk; `Ok` means the server acknowledged it
    async fn upload(&self, chunk: &ChunkUpload) -> MediaResult<()>;
}

/// Multipart HTTP uploader
#[derive(Debug, Clone)]
pub struct HttpUploadSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUploadSink {
    /// Uploader posting to `endpoint` with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> MediaResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Uploader using an existing client
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UploadSink for HttpUploadSink {
    async fn upload(&self, chunk: &ChunkUpload) -> MediaResult<()> {
        let file = Part::bytes(chunk.payload.to_vec())
            .file_name(chunk.file_name())
            .mime_str(&chunk.mime_type)?;
        let form = Form::new()
            .part("file", file)
            .text("roomId", chunk.room_id.clone())
            .text("userId", chunk.user_id.clone())
            .text("isFinal", chunk.is_final.to_string())
            .text("chunkIndex", chunk.index.to_string())
            .text("capturedAt", chunk.captured_at.to_rfc3339());

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| MediaError::Upload {
                index: chunk.index,
                is_final: chunk.is_final,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(index = chunk.index, is_final = chunk.is_final, "Chunk acknowledged");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(MediaError::Upload {
                index: chunk.index,
                is_final: chunk.is_final,
                reason: format!("HTTP {}: {}", status.as_u16(), body),
            })
        }
    }
}

/// Per-chunk retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for one delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Upload with retries. Returns the number of attempts used.
pub async fn upload_with_retry(
    sink: &dyn UploadSink,
    chunk: &ChunkUpload,
    policy: &RetryPolicy,
) -> MediaResult<u32> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match sink.upload(chunk).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    index = chunk.index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Chunk upload failed, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        failures_left: AtomicU32,
        calls: Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl UploadSink for FlakySink {
        async fn upload(&self, chunk: &ChunkUpload) -> MediaResult<()> {
            self.calls.lock().push(tokio::time::Instant::now());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(MediaError::Upload {
                    index: chunk.index,
                    is_final: chunk.is_final,
                    reason: "HTTP 503".to_string(),
                });
            }
            Ok(())
        }
    }

    fn chunk() -> ChunkUpload {
        ChunkUpload {
            room_id: "room-1".to_string(),
            user_id: "patient1".to_string(),
            index: 3,
            captured_at: Utc::now(),
            is_final: false,
            mime_type: "video/webm".to_string(),
            payload: Bytes::from_static(b"data"),
        }
    }

    #[test]
    fn test_delays() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|a| policy.delay_after(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
    }

    #[test]
    fn test_file_name() {
        let chunk = chunk();
        let name = chunk.file_name();
        assert!(name.starts_with("recording_room-1_"));
        assert!(name.ends_with("_3.webm"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let sink = FlakySink {
            failures_left: AtomicU32::new(2),
            calls: Mutex::new(Vec::new()),
        };
        let attempts = upload_with_retry(&sink, &chunk(), &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(attempts, 3);

        let calls = sink.calls.lock();
        assert_eq!(calls[1] - calls[0], Duration::from_millis(500));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let sink = FlakySink {
            failures_left: AtomicU32::new(10),
            calls: Mutex::new(Vec::new()),
        };
        let result = upload_with_retry(&sink, &chunk(), &RetryPolicy::default()).await;
        assert!(matches!(result, Err(MediaError::Upload { index: 3, .. })));
        assert_eq!(sink.calls.lock().len(), 5);
    }
}
