//! Snapshot Trigger Service
//!
//! Listens to object-detection events published over MQTT and, when a camera
//! reports a single confident `person` detection, asks the camera vendor API
//! for a snapshot, waits for it to be published and stores the image locally.
//!
//! ## Features
//!
//! - **Event Filtering**: exactly one object of the watched class above the
//!   confidence threshold triggers a capture
//! - **Cooldown**: at most one capture per cooldown window, shared by every
//!   device or tracked per device
//! - **Two-Phase Snapshot Workflow**: submit, poll for the image URL,
//!   download, bounded by a retry budget and an overall deadline
//! - **Message Log**: every received message appended to a text log
//!
//! ## Architecture
//!
//! ```text
//! MQTT Broker                                            Camera API
//! ┌──────────────┐                                      ┌──────────────┐
//! │ detections   │                                      │ generate     │
//! │ (topic: #)   │                                      │ Snapshot     │
//! └──────────────┘                                      └──────────────┘
//!        │                                                     ▲
//!        ▼                                                     │
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐     │
//! │ MQTT         │───▶│ Event        │───▶│ Rate         │     │
//! │ Consumer     │    │ Filter       │    │ Limiter      │     │
//! └──────────────┘    └──────────────┘    └──────────────┘     │
//!        │                                       │             │
//!        ▼                                       ▼             │
//! ┌──────────────┐                        ┌──────────────┐     │
//! │ Message      │                        │ Snapshot     │─────┘
//! │ Log          │                        │ Workflow     │
//! └──────────────┘                        └──────────────┘
//!                                                │
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │ Image Store  │
//!                                         └──────────────┘
//! ```

pub mod camera_api;
pub mod config;
pub mod dispatcher;
pub mod event_filter;
pub mod image_store;
pub mod message_log;
pub mod mqtt_consumer;
pub mod rate_limiter;
pub mod snapshot_workflow;

pub use camera_api::{ApiResponse, CameraApi, CameraApiError, HttpCameraApi};
pub use config::Config;
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use event_filter::{
    DetectedObject, DetectionEvent, EventFilter, FilterError, SkipReason, TriggerDecision,
};
pub use image_store::{ImageArtifact, ImageStore};
pub use message_log::MessageLog;
pub use mqtt_consumer::{ConsumerError, IncomingMessage, MessageHandler, MqttConsumer};
pub use rate_limiter::{rate_limiter_for, GlobalCooldown, PerDeviceCooldown, RateLimiter};
pub use snapshot_workflow::{JobOutcome, SnapshotJob, SnapshotWorkflow, WorkflowFailure, WorkflowStep};
