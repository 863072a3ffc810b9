//! Optional webhook notifications for job lifecycle transitions.
//!
//! Delivery is best-effort and never awaited by the caller: each
//! notification is posted from its own task so a slow receiver cannot
//! stall a worker or an HTTP handler.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use vmexport_protocol::Job;

/// Sink for job lifecycle notifications. Implementations receive
/// redacted snapshots; invocation order reflects status transitions
/// but delivery is best-effort.
pub trait WebhookSink: Send + Sync {
    fn job_created(&self, job: &Job);
    fn job_started(&self, job: &Job);
    fn job_completed(&self, job: &Job);
    fn job_failed(&self, job: &Job);
    fn job_cancelled(&self, job: &Job);
    fn job_progress(&self, job: &Job);
}

/// Posts each event as JSON to a single webhook URL.
pub struct HttpWebhookSink {
    client: reqwest::Client,
    url: String,
}

impl HttpWebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    fn post(&self, event: &str, job: &Job) {
        let payload = serde_json::json!({
            "event": event,
            "timestamp": Utc::now(),
            "job": job.redacted(),
        });
        let client = self.client.clone();
        let url = self.url.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                debug!(event = %event, error = %e, "webhook delivery failed");
            }
        });
    }
}

impl WebhookSink for HttpWebhookSink {
    fn job_created(&self, job: &Job) {
        self.post("job.created", job);
    }
    fn job_started(&self, job: &Job) {
        self.post("job.started", job);
    }
    fn job_completed(&self, job: &Job) {
        self.post("job.completed", job);
    }
    fn job_failed(&self, job: &Job) {
        self.post("job.failed", job);
    }
    fn job_cancelled(&self, job: &Job) {
        self.post("job.cancelled", job);
    }
    fn job_progress(&self, job: &Job) {
        self.post("job.progress", job);
    }
}
