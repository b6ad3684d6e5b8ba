//! Detection event decoding and trigger decisions.

use crate::config::TriggerConfig;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Errors that can occur while reading a detection payload
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Failed to decode detection payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Detection event published by a camera
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DetectionEvent {
    /// Objects detected in the frame, in publisher order
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
}

/// A single detected object
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DetectedObject {
    /// Detection class, e.g. "person"
    #[serde(rename = "type")]
    pub object_type: String,
    /// Confidence score (0 - 100)
    pub confidence: f64,
}

/// Why an event did not qualify as a trigger
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Event did not carry exactly one object
    ObjectCount(usize),
    /// The single object was of another class
    ObjectType(String),
    /// The single object was not confident enough
    LowConfidence(f64),
    /// Topic has no device serial segment
    MissingSerial,
    /// Serial segment contains characters a device serial never has
    InvalidSerial(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ObjectCount(n) => write!(f, "{} objects detected", n),
            SkipReason::ObjectType(t) => write!(f, "object type {} not watched", t),
            SkipReason::LowConfidence(c) => write!(f, "confidence {} below threshold", c),
            SkipReason::MissingSerial => write!(f, "no device serial in topic"),
            SkipReason::InvalidSerial(s) => write!(f, "invalid device serial {:?}", s),
        }
    }
}

/// Decision on whether an event should trigger a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    /// Capture a snapshot from the given device
    Capture { device_serial: String },
    /// Ignore the event
    Skip { reason: SkipReason },
}

impl TriggerDecision {
    pub fn should_capture(&self) -> bool {
        matches!(self, TriggerDecision::Capture { .. })
    }

    /// Serial of the device to capture from; only present on a capture
    pub fn device_serial(&self) -> Option<&str> {
        match self {
            TriggerDecision::Capture { device_serial } => Some(device_serial.as_str()),
            TriggerDecision::Skip { .. } => None,
        }
    }
}

/// Decides which detection events warrant a snapshot.
///
/// An event triggers when it carries exactly one object, that object is of
/// the watched class, and its confidence strictly exceeds the threshold.
/// Events with several simultaneous detections are ignored rather than
/// aggregated.
pub struct EventFilter {
    config: TriggerConfig,
}

impl EventFilter {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    /// Decode a raw message payload
    pub fn decode(payload: &[u8]) -> Result<DetectionEvent, FilterError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Evaluate a decoded event received on `topic`
    pub fn evaluate(&self, topic: &str, event: &DetectionEvent) -> TriggerDecision {
        let [object] = event.objects.as_slice() else {
            return TriggerDecision::Skip {
                reason: SkipReason::ObjectCount(event.objects.len()),
            };
        };

        if object.object_type != self.config.object_type {
            return TriggerDecision::Skip {
                reason: SkipReason::ObjectType(object.object_type.clone()),
            };
        }

        if object.confidence <= self.config.min_confidence {
            return TriggerDecision::Skip {
                reason: SkipReason::LowConfidence(object.confidence),
            };
        }

        match device_serial_from_topic(topic) {
            Some(serial) if is_valid_device_serial(serial) => TriggerDecision::Capture {
                device_serial: serial.to_string(),
            },
            Some(serial) => TriggerDecision::Skip {
                reason: SkipReason::InvalidSerial(serial.to_string()),
            },
            None => TriggerDecision::Skip {
                reason: SkipReason::MissingSerial,
            },
        }
    }
}

/// Extract the device serial from a topic such as `cameras/<serial>/events`.
///
/// The serial is the second-to-last `/` separated segment.
pub fn device_serial_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.rsplit('/');
    segments.next()?;
    segments.next().filter(|s| !s.is_empty())
}

/// Whether `serial` looks like a device serial: ASCII letters, digits,
/// `-` and `_` only.
pub fn is_valid_device_serial(serial: &str) -> bool {
    !serial.is_empty()
        && serial
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
