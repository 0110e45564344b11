//! Call status reporting
//!
//! A [`CallStatusSink`] hears about every finished call after teardown.
//! [`HttpCallStatusSink`] marks the local user available again on the
//! user service, which is what a doctor's client does after each
//! consultation.

use crate::call::{CallOutcome, CallSession};
use async_trait::async_trait;
use consultrtc_core::{ConsultRtcError, Result};
use std::time::Duration;
use tracing::debug;

/// Receives the outcome of every finished call
#[async_trait]
pub trait CallStatusSink: Send + Sync {
    /// Called once per call, after teardown
    async fn call_finished(&self, session: &CallSession, outcome: &CallOutcome) -> Result<()>;
}

/// Marks the local user available through
/// `PATCH {base_url}/users/update_availability/{user_id}/true`
#[derive(Debug, Clone)]
pub struct HttpCallStatusSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCallStatusSink {
    /// Sink talking to `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConsultRtcError::InvalidConfiguration {
                field: "status_url".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, base_url))
    }

    /// Sink using an existing client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Availability URL for `user_id`
    pub fn availability_url(&self, user_id: &str) -> String {
        format!(
            "{}/users/update_availability/{}/true",
            self.base_url.trim_end_matches('/'),
            user_id
        )
    }
}

#[async_trait]
impl CallStatusSink for HttpCallStatusSink {
    async fn call_finished(&self, session: &CallSession, _outcome: &CallOutcome) -> Result<()> {
        let user_id = session.local_id();
        let failed = |reason: String| ConsultRtcError::StatusUpdate {
            user_id: user_id.to_string(),
            reason,
        };
        let response = self
            .client
            .patch(self.availability_url(user_id))
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(user_id, "Availability restored");
            Ok(())
        } else {
            Err(failed(format!("HTTP {}", status.as_u16())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_url() {
        let sink = HttpCallStatusSink::new("http://localhost:8000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            sink.availability_url("doc-4"),
            "http://localhost:8000/users/update_availability/doc-4/true"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_status_error() {
        use crate::call::{CallRole, CallState, EndReason};
        use chrono::Utc;

        let sink = HttpCallStatusSink::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let session = CallSession {
            id: "s1".to_string(),
            role: CallRole::Callee,
            caller_id: "patient1".to_string(),
            callee_id: "doc1".to_string(),
            consultation_id: "c1".to_string(),
            state: CallState::Ended,
            local_description: None,
            remote_description: None,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: Some(Utc::now()),
        };
        let outcome = CallOutcome {
            session_id: "s1".to_string(),
            state: CallState::Ended,
            reason: EndReason::RemoteHangup,
            error: None,
            duration: None,
        };
        let err = sink.call_finished(&session, &outcome).await.unwrap_err();
        assert!(matches!(err, ConsultRtcError::StatusUpdate { ref user_id, .. } if user_id == "doc1"));
        assert!(err.is_transient());
    }
}
