//! Op Event Hub event kinds and payloads (Section 4.6).

use crate::types::Id;
use serde::{Deserialize, Serialize};

/// Event kinds emitted on the Op Event Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename = "op.bootstrap")]
    OpBootstrap,
    #[serde(rename = "op.status")]
    OpStatus,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.ended")]
    StepEnded,
    #[serde(rename = "step.artifacts")]
    StepArtifacts,
    #[serde(rename = "op.completed")]
    OpCompleted,
    #[serde(rename = "op.failed")]
    OpFailed,
    #[serde(rename = "op.heartbeat")]
    OpHeartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpBootstrap => "op.bootstrap",
            Self::OpStatus => "op.status",
            Self::StepStarted => "step.started",
            Self::StepEnded => "step.ended",
            Self::StepArtifacts => "step.artifacts",
            Self::OpCompleted => "op.completed",
            Self::OpFailed => "op.failed",
            Self::OpHeartbeat => "op.heartbeat",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OpCompleted | Self::OpFailed)
    }
}

/// One event on an op's sequenced stream (Section 4.6).
///
/// `seq` is monotonically increasing per op-id, assigned by the Event Hub at
/// publish time, never by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpEvent {
    pub op_id: Id,
    pub seq: u64,
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub emitted_at: chrono::DateTime<chrono::Utc>,
}

impl OpEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_with_dotted_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::OpBootstrap).unwrap(),
            "\"op.bootstrap\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::StepEnded).unwrap(),
            "\"step.ended\""
        );
    }

    #[test]
    fn terminal_kinds() {
        assert!(EventKind::OpCompleted.is_terminal());
        assert!(EventKind::OpFailed.is_terminal());
        assert!(!EventKind::OpStatus.is_terminal());
    }
}
