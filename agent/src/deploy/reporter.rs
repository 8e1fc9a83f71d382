//! Deployment status reporting

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::client::HttpClient;
use crate::models::deployment::{ControlMessage, JobCompletion, StatusEvent};
use crate::utils::SecretToken;

/// Receives rollout progress
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, event: StatusEvent);

    async fn notify_job_completion(&self, completion: JobCompletion);
}

/// Forwards status frames to the control channel worker
///
/// Frames queue while the channel is reconnecting. Job completions go
/// straight to the backend so they survive a lost connection.
pub struct ChannelReporter {
    frames: mpsc::UnboundedSender<ControlMessage>,
    backend: Option<(HttpClient, SecretToken)>,
}

impl ChannelReporter {
    pub fn new(frames: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            frames,
            backend: None,
        }
    }

    pub fn with_backend(mut self, http: HttpClient, token: SecretToken) -> Self {
        self.backend = Some((http, token));
        self
    }
}

#[async_trait]
impl StatusReporter for ChannelReporter {
    async fn report(&self, event: StatusEvent) {
        info!(
            deployment_id = %event.deployment_id,
            status = ?event.status,
            "{}",
            event.message
        );
        if self.frames.send(ControlMessage::Status(event)).is_err() {
            debug!("Control channel closed, status frame dropped");
        }
    }

    async fn notify_job_completion(&self, completion: JobCompletion) {
        let Some((http, token)) = &self.backend else {
            debug!("No backend configured, job {} not reported", completion.job_id);
            return;
        };
        if let Err(e) = http.complete_job(token.expose(), &completion).await {
            warn!("Failed to report completion of job {}: {}", completion.job_id, e);
        }
    }
}
