//! Event dispatcher: payload decoding, trigger filtering, cooldown gating and
//! snapshot workflow dispatch for every received message.

use crate::config::DispatchMode;
use crate::event_filter::{EventFilter, SkipReason, TriggerDecision};
use crate::image_store::ImageArtifact;
use crate::message_log::MessageLog;
use crate::mqtt_consumer::{ConsumerError, IncomingMessage, MessageHandler};
use crate::rate_limiter::RateLimiter;
use crate::snapshot_workflow::{SnapshotWorkflow, WorkflowFailure};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// What happened to one message
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Payload could not be decoded
    Malformed,
    /// Event did not qualify as a trigger
    NotTriggered(SkipReason),
    /// Trigger refused by the cooldown
    RateLimited { device_serial: String },
    /// Workflow handed to a background task
    Dispatched { device_serial: String },
    /// Workflow ran inline and stored an image
    Captured(ImageArtifact),
    /// Workflow ran inline and failed
    Failed(WorkflowFailure),
}

/// Wires the event filter, rate limiter and snapshot workflow together
pub struct EventDispatcher {
    filter: EventFilter,
    rate_limiter: Arc<dyn RateLimiter>,
    workflow: Arc<SnapshotWorkflow>,
    message_log: Option<Arc<MessageLog>>,
    mode: DispatchMode,
    job_slots: Arc<Semaphore>,
    jobs: TaskTracker,
}

impl EventDispatcher {
    pub fn new(
        filter: EventFilter,
        rate_limiter: Arc<dyn RateLimiter>,
        workflow: Arc<SnapshotWorkflow>,
        mode: DispatchMode,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            filter,
            rate_limiter,
            workflow,
            message_log: None,
            mode,
            job_slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            jobs: TaskTracker::new(),
        }
    }

    /// Record every received message in `log`
    pub fn with_message_log(mut self, log: Arc<MessageLog>) -> Self {
        self.message_log = Some(log);
        self
    }

    /// Handle one message; the raw message is logged exactly once whatever
    /// the outcome.
    #[instrument(skip(self, payload))]
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        metrics::counter!("snapshot.messages.received").increment(1);

        let outcome = self.dispatch(topic, payload).await;

        if let Some(log) = &self.message_log {
            log.append(topic, payload).await;
        }

        outcome
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let event = match EventFilter::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!("snapshot.messages.malformed").increment(1);
                warn!(topic = %topic, error = %e, "Ignoring malformed payload");
                return DispatchOutcome::Malformed;
            }
        };

        let device_serial = match self.filter.evaluate(topic, &event) {
            TriggerDecision::Capture { device_serial } => device_serial,
            TriggerDecision::Skip { reason } => {
                if matches!(reason, SkipReason::MissingSerial | SkipReason::InvalidSerial(_)) {
                    warn!(topic = %topic, reason = %reason, "Qualifying detection without a usable device serial");
                } else {
                    debug!(topic = %topic, reason = %reason, "Event does not trigger a snapshot");
                }
                return DispatchOutcome::NotTriggered(reason);
            }
        };

        metrics::counter!("snapshot.triggers").increment(1);

        let now = Instant::now();
        if !self.rate_limiter.try_acquire(&device_serial, now) {
            metrics::counter!("snapshot.triggers.rate_limited").increment(1);
            info!(
                device_serial = %device_serial,
                remaining_secs = self.rate_limiter.remaining(&device_serial, now).as_secs(),
                "Cooldown active, snapshot skipped"
            );
            return DispatchOutcome::RateLimited { device_serial };
        }

        info!(device_serial = %device_serial, "Person detected, capturing snapshot");

        match self.mode {
            DispatchMode::Inline => match self.workflow.execute(&device_serial).await {
                Ok(artifact) => DispatchOutcome::Captured(artifact),
                Err(failure) => DispatchOutcome::Failed(failure),
            },
            DispatchMode::Spawned => {
                let workflow = self.workflow.clone();
                let slots = self.job_slots.clone();
                let serial = device_serial.clone();
                self.jobs.spawn(async move {
                    let _permit = match slots.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    // Outcome is logged by the workflow
                    let _ = workflow.execute(&serial).await;
                });
                DispatchOutcome::Dispatched { device_serial }
            }
        }
    }

    /// Wait for every background job to finish.
    ///
    /// Called once the consumer has stopped; each job is still bounded by the
    /// workflow deadline.
    pub async fn drain(&self) {
        self.jobs.close();
        if !self.jobs.is_empty() {
            info!(jobs = self.jobs.len(), "Waiting for snapshot jobs to finish");
        }
        self.jobs.wait().await;
    }
}

#[async_trait::async_trait]
impl MessageHandler for EventDispatcher {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        match self.on_message(&message.topic, &message.payload).await {
            DispatchOutcome::Failed(failure) => {
                Err(ConsumerError::ProcessingError(failure.to_string()))
            }
            _ => Ok(()),
        }
    }
}
