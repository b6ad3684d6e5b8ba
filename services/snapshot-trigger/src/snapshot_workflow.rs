//! Submit, poll and download workflow for a single snapshot.
//!
//! ```text
//! Submit ──202──▶ Poll ──url──▶ Download ──200──▶ Downloaded
//!   │               │              │
//!   └─ other ─▶     └─ exhausted ─▶└─ other ─▶ Failed
//! ```
//!
//! Every terminal failure is returned to the caller; nothing is retried
//! beyond the poll budget and the rate limiter permit is never refunded.

use crate::camera_api::{ApiResponse, CameraApi, CameraApiError};
use crate::config::{PollStrategy, WorkflowConfig};
use crate::image_store::{ImageArtifact, ImageStore};
use chrono::Local;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// HTTP status of an accepted generate request
const STATUS_ACCEPTED: u16 = 202;
/// HTTP status of a successful download
const STATUS_OK: u16 = 200;

/// Phase of the workflow an error occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    Submit,
    Poll,
    Download,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStep::Submit => write!(f, "submit"),
            WorkflowStep::Poll => write!(f, "poll"),
            WorkflowStep::Download => write!(f, "download"),
        }
    }
}

/// Terminal failures of a snapshot workflow
#[derive(Error, Debug)]
pub enum WorkflowFailure {
    #[error("Snapshot generation rejected with status {status}: {body}")]
    SubmitRejected { status: u16, body: String },

    #[error("Snapshot URL not found after {attempts} attempts")]
    SnapshotUrlNotFound { attempts: u32 },

    #[error("Snapshot download failed with status {status}")]
    DownloadFailed { status: u16 },

    #[error("Transport error during {step}: {source}")]
    Transport {
        step: WorkflowStep,
        #[source]
        source: CameraApiError,
    },

    #[error("Failed to write snapshot: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Snapshot workflow exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl WorkflowFailure {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowFailure::SubmitRejected { .. } => "submit_rejected",
            WorkflowFailure::SnapshotUrlNotFound { .. } => "url_not_found",
            WorkflowFailure::DownloadFailed { .. } => "download_failed",
            WorkflowFailure::Transport { .. } => "transport",
            WorkflowFailure::Persist(_) => "persist",
            WorkflowFailure::DeadlineExceeded(_) => "deadline",
        }
    }
}

/// Outcome of a snapshot job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Pending,
    Downloaded,
    Failed(String),
}

/// State of one workflow run
#[derive(Debug, Clone)]
pub struct SnapshotJob {
    pub id: Uuid,
    pub device_serial: String,
    /// Number of responses inspected for a snapshot URL
    pub poll_attempt: u32,
    pub snapshot_url: Option<String>,
    pub outcome: JobOutcome,
}

impl SnapshotJob {
    pub fn new(device_serial: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_serial: device_serial.into(),
            poll_attempt: 0,
            snapshot_url: None,
            outcome: JobOutcome::Pending,
        }
    }

    fn finish(&mut self, result: &Result<ImageArtifact, WorkflowFailure>) {
        self.outcome = match result {
            Ok(_) => JobOutcome::Downloaded,
            Err(e) => JobOutcome::Failed(e.to_string()),
        };
    }
}

/// Runs snapshot jobs against a [`CameraApi`]
pub struct SnapshotWorkflow {
    api: Arc<dyn CameraApi>,
    store: ImageStore,
    config: WorkflowConfig,
}

impl SnapshotWorkflow {
    pub fn new(api: Arc<dyn CameraApi>, store: ImageStore, config: WorkflowConfig) -> Self {
        Self { api, store, config }
    }

    /// Capture and persist one snapshot from `device_serial`
    #[instrument(skip(self))]
    pub async fn execute(&self, device_serial: &str) -> Result<ImageArtifact, WorkflowFailure> {
        let started = Instant::now();
        let deadline = self.config.deadline();
        let mut job = SnapshotJob::new(device_serial);

        let result = match tokio::time::timeout(deadline, self.run(&mut job)).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowFailure::DeadlineExceeded(deadline)),
        };
        job.finish(&result);

        metrics::histogram!("snapshot.job.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(artifact) => {
                metrics::counter!("snapshot.jobs.downloaded").increment(1);
                info!(
                    job_id = %job.id,
                    device_serial = %job.device_serial,
                    file = %artifact.file_name,
                    size_bytes = artifact.size_bytes,
                    poll_attempts = job.poll_attempt,
                    "Snapshot downloaded"
                );
            }
            Err(e) => {
                metrics::counter!("snapshot.jobs.failed", "reason" => e.kind()).increment(1);
                warn!(
                    job_id = %job.id,
                    device_serial = %job.device_serial,
                    poll_attempts = job.poll_attempt,
                    snapshot_url = ?job.snapshot_url,
                    outcome = ?job.outcome,
                    "Snapshot workflow failed"
                );
            }
        }

        result
    }

    async fn run(&self, job: &mut SnapshotJob) -> Result<ImageArtifact, WorkflowFailure> {
        let response = self.submit(job, WorkflowStep::Submit).await?;
        info!(job_id = %job.id, "Snapshot generation accepted, waiting for completion");

        let url = self.poll(job, response).await?;
        self.download(job, &url).await
    }

    async fn submit(
        &self,
        job: &SnapshotJob,
        step: WorkflowStep,
    ) -> Result<ApiResponse, WorkflowFailure> {
        let response = self
            .api
            .generate_snapshot(&job.device_serial)
            .await
            .map_err(|source| WorkflowFailure::Transport { step, source })?;

        if response.status != STATUS_ACCEPTED {
            error!(
                job_id = %job.id,
                status = response.status,
                body = %response.text(),
                "Snapshot generation rejected"
            );
            return Err(WorkflowFailure::SubmitRejected {
                status: response.status,
                body: response.text(),
            });
        }

        Ok(response)
    }

    /// Inspect responses until one carries the snapshot URL
    async fn poll(
        &self,
        job: &mut SnapshotJob,
        mut response: ApiResponse,
    ) -> Result<String, WorkflowFailure> {
        loop {
            job.poll_attempt += 1;
            metrics::counter!("snapshot.poll.attempts").increment(1);

            if let Some(url) = response.snapshot_url() {
                debug!(job_id = %job.id, attempt = job.poll_attempt, url = %url, "Snapshot URL received");
                job.snapshot_url = Some(url.clone());
                return Ok(url);
            }

            if job.poll_attempt >= self.config.max_poll_attempts {
                error!(
                    job_id = %job.id,
                    attempts = job.poll_attempt,
                    "Maximum poll attempts reached without a snapshot URL"
                );
                return Err(WorkflowFailure::SnapshotUrlNotFound {
                    attempts: job.poll_attempt,
                });
            }

            debug!(
                job_id = %job.id,
                attempt = job.poll_attempt,
                retry_in_secs = self.config.poll_interval_secs,
                "Snapshot URL not in response, retrying"
            );
            tokio::time::sleep(self.config.poll_interval()).await;

            if self.config.poll_strategy == PollStrategy::Resubmit {
                response = self.submit(job, WorkflowStep::Poll).await?;
            }
        }
    }

    async fn download(
        &self,
        job: &SnapshotJob,
        url: &str,
    ) -> Result<ImageArtifact, WorkflowFailure> {
        // Give the camera time to publish the image
        tokio::time::sleep(self.config.download_delay()).await;

        let response = self
            .api
            .download(url)
            .await
            .map_err(|source| WorkflowFailure::Transport {
                step: WorkflowStep::Download,
                source,
            })?;

        if response.status != STATUS_OK {
            return Err(WorkflowFailure::DownloadFailed {
                status: response.status,
            });
        }

        Ok(self
            .store
            .save(&job.device_serial, &response.body, Local::now())
            .await?)
    }
}
