//! Sequenced job events and payload validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Kind of a job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Chunk,
    Log,
    /// An AI-derived judgment; payload must carry confidence, sources and reasoning.
    Decision,
    Completed,
    Failed,
    Cancelled,
    Crashed,
    Resumed,
}

impl EventKind {
    /// Kinds a worker may append directly. Everything else is written by
    /// the job manager as part of a lifecycle operation.
    pub fn is_producer_kind(&self) -> bool {
        matches!(self, Self::Progress | Self::Chunk | Self::Log | Self::Decision)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Chunk => "chunk",
            Self::Log => "log",
            Self::Decision => "decision",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Crashed => "crashed",
            Self::Resumed => "resumed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event kind: {s}"))
    }
}

/// An immutable, sequenced fact in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub job_id: Uuid,
    /// Strictly increasing per job, starting at 1.
    pub sequence: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Fields every decision event must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub confidence: f64,
    pub sources: Vec<String>,
    pub reasoning: String,
}

/// Progress fields lifted out of an event payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub progress: Option<u8>,
    pub step: Option<String>,
}

/// Validate a producer payload for `kind` and extract progress fields.
pub fn validate_payload(
    kind: EventKind,
    payload: &serde_json::Value,
) -> Result<ProgressUpdate, JobError> {
    if !(payload.is_object() || payload.is_null()) {
        return Err(JobError::InvalidEvent {
            reason: format!("{kind} payload must be a JSON object"),
        });
    }

    if kind == EventKind::Decision {
        validate_judgment(payload)?;
    }

    let progress = match payload.get("progress") {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(p) if p <= 100 => Some(p as u8),
            _ => {
                return Err(JobError::InvalidEvent {
                    reason: format!("progress must be an integer in 0..=100, got {value}"),
                });
            }
        },
    };

    let step = match payload.get("step") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(JobError::InvalidEvent {
                reason: format!("step must be a string, got {other}"),
            });
        }
    };

    Ok(ProgressUpdate { progress, step })
}

fn validate_judgment(payload: &serde_json::Value) -> Result<Judgment, JobError> {
    let judgment: Judgment =
        serde_json::from_value(payload.clone()).map_err(|e| JobError::InvalidEvent {
            reason: format!("decision events need confidence, sources and reasoning: {e}"),
        })?;

    if !(0.0..=1.0).contains(&judgment.confidence) {
        return Err(JobError::InvalidEvent {
            reason: format!("confidence {} outside 0.0..=1.0", judgment.confidence),
        });
    }
    if judgment.reasoning.trim().is_empty() {
        return Err(JobError::InvalidEvent {
            reason: "decision reasoning is empty".to_string(),
        });
    }
    Ok(judgment)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn progress_fields_are_extracted() {
        let update =
            validate_payload(EventKind::Progress, &json!({"progress": 40, "step": "Fetching"}))
                .unwrap();
        assert_eq!(update.progress, Some(40));
        assert_eq!(update.step.as_deref(), Some("Fetching"));
    }

    #[test]
    fn progress_out_of_range_is_rejected() {
        let err = validate_payload(EventKind::Progress, &json!({"progress": 101})).unwrap_err();
        assert!(matches!(err, JobError::InvalidEvent { .. }));
        let err = validate_payload(EventKind::Progress, &json!({"progress": -1})).unwrap_err();
        assert!(matches!(err, JobError::InvalidEvent { .. }));
    }

    #[test]
    fn chunk_without_progress_is_fine() {
        let update = validate_payload(EventKind::Chunk, &json!({"text": "partial"})).unwrap();
        assert_eq!(update, ProgressUpdate::default());
    }

    #[test]
    fn decision_requires_judgment_fields() {
        let ok = json!({
            "confidence": 0.82,
            "sources": ["doc-1", "doc-7"],
            "reasoning": "Both sources agree on the date."
        });
        assert!(validate_payload(EventKind::Decision, &ok).is_ok());

        let missing = json!({"confidence": 0.9, "reasoning": "trust me"});
        assert!(validate_payload(EventKind::Decision, &missing).is_err());

        let bad_confidence = json!({"confidence": 1.5, "sources": [], "reasoning": "x"});
        assert!(validate_payload(EventKind::Decision, &bad_confidence).is_err());

        let blank = json!({"confidence": 0.5, "sources": [], "reasoning": "  "});
        assert!(validate_payload(EventKind::Decision, &blank).is_err());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(validate_payload(EventKind::Log, &json!("just text")).is_err());
        assert!(validate_payload(EventKind::Log, &serde_json::Value::Null).is_ok());
    }

    #[test]
    fn producer_kinds() {
        assert!(EventKind::Progress.is_producer_kind());
        assert!(EventKind::Decision.is_producer_kind());
        assert!(!EventKind::Completed.is_producer_kind());
        assert!(!EventKind::Crashed.is_producer_kind());
        assert!(!EventKind::Resumed.is_producer_kind());
    }

    #[test]
    fn event_serializes_kind_as_type() {
        let event = Event {
            job_id: Uuid::new_v4(),
            sequence: 3,
            kind: EventKind::Resumed,
            payload: json!({}),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "resumed");
        assert_eq!(value["sequence"], 3);
        assert_eq!("resumed".parse::<EventKind>().unwrap(), EventKind::Resumed);
    }
}
