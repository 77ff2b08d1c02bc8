use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(format!("exec-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one execution attempt. The serialized names are part of the
/// externally inspected audit contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    PartialSuccess,
    PolicyViolation,
    ResolutionFailed,
    ConditionNotMet,
    ExecutionFailed,
    InvalidRequest,
    DuplicateExecution,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::ResolutionFailed => "RESOLUTION_FAILED",
            Self::ConditionNotMet => "CONDITION_NOT_MET",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::DuplicateExecution => "DUPLICATE_EXECUTION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Self::Success),
            "PARTIAL_SUCCESS" => Some(Self::PartialSuccess),
            "POLICY_VIOLATION" => Some(Self::PolicyViolation),
            "RESOLUTION_FAILED" => Some(Self::ResolutionFailed),
            "CONDITION_NOT_MET" => Some(Self::ConditionNotMet),
            "EXECUTION_FAILED" => Some(Self::ExecutionFailed),
            "INVALID_REQUEST" => Some(Self::InvalidRequest),
            "DUPLICATE_EXECUTION" => Some(Self::DuplicateExecution),
            _ => None,
        }
    }

    /// True when money moved for this attempt. A replay of such an attempt must
    /// not execute again.
    pub fn moved_funds(&self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }

    /// True when the attempt completed without a business failure, including
    /// the no-op and replay outcomes.
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::PartialSuccess | Self::ConditionNotMet | Self::DuplicateExecution
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionStatus;

    #[test]
    fn execution_status_round_trips_from_storage_encoding() {
        let cases = [
            ExecutionStatus::Success,
            ExecutionStatus::PartialSuccess,
            ExecutionStatus::PolicyViolation,
            ExecutionStatus::ResolutionFailed,
            ExecutionStatus::ConditionNotMet,
            ExecutionStatus::ExecutionFailed,
            ExecutionStatus::InvalidRequest,
            ExecutionStatus::DuplicateExecution,
        ];

        for status in cases {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
            let encoded = serde_json::to_value(status).expect("serialize status");
            assert_eq!(encoded, serde_json::Value::String(status.as_str().to_string()));
        }
    }
}
