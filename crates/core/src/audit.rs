use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::execution::{ChatId, ExecutionId, ExecutionStatus};
use crate::policy::PolicyValidationResult;
use crate::processor::ExecutionResult;
use crate::resolver::ResolutionResult;

/// Immutable record of one execution attempt. The serialized shape is the
/// externally inspected audit contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub chat_id: ChatId,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    /// Earlier attempt that already moved funds, set on replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<u32>,
    pub resolution_result: Option<ResolutionResult>,
    pub policy_result: Option<PolicyValidationResult>,
    pub execution_result: Option<ExecutionResult>,
    pub status: ExecutionStatus,
    pub summary: String,
}

impl ExecutionRecord {
    /// True when any transfer went through, whatever the final status. A
    /// policy violation can still carry the approved items' payments.
    pub fn moved_funds(&self) -> bool {
        self.status.moved_funds()
            || self
                .execution_result
                .as_ref()
                .is_some_and(|result| !result.successful_payments.is_empty())
    }
}

/// Collects whatever stage results exist and derives the record. Pure: no
/// I/O, and `build` always yields a well-formed record.
#[derive(Clone, Debug)]
pub struct AuditTrailBuilder {
    execution_id: ExecutionId,
    chat_id: ChatId,
    timestamp: DateTime<Utc>,
    attempt: u32,
    replay_of: Option<u32>,
    resolution: Option<ResolutionResult>,
    policy: Option<PolicyValidationResult>,
    execution: Option<ExecutionResult>,
    invalid_request: Option<String>,
    fault: Option<String>,
}

impl AuditTrailBuilder {
    pub fn new(execution_id: ExecutionId, chat_id: ChatId) -> Self {
        Self {
            execution_id,
            chat_id,
            timestamp: Utc::now(),
            attempt: 1,
            replay_of: None,
            resolution: None,
            policy: None,
            execution: None,
            invalid_request: None,
            fault: None,
        }
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn replay_of(mut self, attempt: u32) -> Self {
        self.replay_of = Some(attempt);
        self
    }

    pub fn resolution(mut self, result: ResolutionResult) -> Self {
        self.resolution = Some(result);
        self
    }

    pub fn policy(mut self, result: PolicyValidationResult) -> Self {
        self.policy = Some(result);
        self
    }

    pub fn execution(mut self, result: ExecutionResult) -> Self {
        self.execution = Some(result);
        self
    }

    pub fn invalid_request(mut self, reason: impl Into<String>) -> Self {
        self.invalid_request = Some(reason.into());
        self
    }

    /// Unexpected fault outside any stage's own error channel.
    pub fn fault(mut self, reason: impl Into<String>) -> Self {
        self.fault = Some(reason.into());
        self
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.fault.is_some() {
            return ExecutionStatus::ExecutionFailed;
        }
        if self.invalid_request.is_some() {
            return ExecutionStatus::InvalidRequest;
        }
        if self.replay_of.is_some() {
            return ExecutionStatus::DuplicateExecution;
        }
        let Some(resolution) = &self.resolution else {
            return ExecutionStatus::InvalidRequest;
        };
        if !resolution.success {
            return ExecutionStatus::ResolutionFailed;
        }
        if resolution.condition_not_met() {
            return ExecutionStatus::ConditionNotMet;
        }
        let Some(policy) = &self.policy else {
            return ExecutionStatus::ExecutionFailed;
        };
        // Any rejected item fails the attempt, even when the approved items ran.
        if !policy.success || policy.successful_items.is_empty() {
            return ExecutionStatus::PolicyViolation;
        }
        let Some(execution) = &self.execution else {
            return ExecutionStatus::ExecutionFailed;
        };
        if execution.successful_payments.is_empty() {
            return ExecutionStatus::ExecutionFailed;
        }
        if !execution.failed_payments.is_empty() {
            return ExecutionStatus::PartialSuccess;
        }
        ExecutionStatus::Success
    }

    fn summary(&self, status: ExecutionStatus) -> String {
        match status {
            ExecutionStatus::ExecutionFailed if self.fault.is_some() => {
                format!("execution aborted: {}", self.fault.as_deref().unwrap_or_default())
            }
            ExecutionStatus::InvalidRequest => match &self.invalid_request {
                Some(reason) => format!("invalid request: {reason}"),
                None => "invalid request: no resolution was attempted".to_string(),
            },
            ExecutionStatus::DuplicateExecution => format!(
                "replay of attempt {} which already moved funds; nothing executed",
                self.replay_of.unwrap_or_default()
            ),
            ExecutionStatus::ResolutionFailed => {
                let errors = self
                    .resolution
                    .iter()
                    .flat_map(|resolution| resolution.errors.iter())
                    .map(|issue| format!("{}: {}", issue.code, issue.message))
                    .collect::<Vec<_>>();
                format!("resolution failed: {}", errors.join("; "))
            }
            ExecutionStatus::ConditionNotMet => {
                let unmet = self
                    .resolution
                    .as_ref()
                    .map(|resolution| resolution.unmet_conditions.len())
                    .unwrap_or_default();
                format!("{unmet} condition(s) not met; no payments were due")
            }
            ExecutionStatus::PolicyViolation => {
                let (approved, rejected) = self
                    .policy
                    .as_ref()
                    .map(|policy| (policy.successful_items.len(), policy.failed_items.len()))
                    .unwrap_or_default();
                match &self.execution {
                    Some(execution) => format!(
                        "policy rejected {} of {} item(s); {} of {} approved item(s) paid, total {}",
                        rejected,
                        approved + rejected,
                        execution.successful_payments.len(),
                        approved,
                        execution.total_amount,
                    ),
                    None => format!("policy rejected all {rejected} item(s); nothing executed"),
                }
            }
            _ => self.execution_summary(status),
        }
    }

    fn execution_summary(&self, status: ExecutionStatus) -> String {
        let rejected = self.policy.as_ref().map(|policy| policy.failed_items.len()).unwrap_or_default();
        match &self.execution {
            Some(execution) => format!(
                "{}: {} of {} item(s) paid, total {} ({} failed, {} rejected by policy)",
                status,
                execution.successful_payments.len(),
                execution.submitted() + rejected,
                execution.total_amount,
                execution.failed_payments.len(),
                rejected,
            ),
            None => format!("{status}: no execution result"),
        }
    }

    pub fn build(self) -> ExecutionRecord {
        let status = self.status();
        let summary = self.summary(status);
        ExecutionRecord {
            execution_id: self.execution_id,
            chat_id: self.chat_id,
            timestamp: self.timestamp,
            attempt: self.attempt,
            replay_of: self.replay_of,
            resolution_result: self.resolution,
            policy_result: self.policy,
            execution_result: self.execution,
            status,
            summary,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("execution `{execution_id}` attempt {attempt} is already recorded")]
    AlreadyRecorded { execution_id: ExecutionId, attempt: u32 },
    #[error("audit store unavailable: {0}")]
    Storage(String),
    #[error("audit record could not be encoded: {0}")]
    Encoding(String),
}

/// Append-only store of execution records keyed by `(execution_id, attempt)`.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), AuditStoreError>;

    /// Every recorded attempt for `execution_id`, oldest first.
    async fn attempts(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ExecutionRecord>, AuditStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl InMemoryAuditStore {
    pub fn records(&self) -> Vec<ExecutionRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), AuditStoreError> {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        let exists = records.iter().any(|existing| {
            existing.execution_id == record.execution_id && existing.attempt == record.attempt
        });
        if exists {
            return Err(AuditStoreError::AlreadyRecorded {
                execution_id: record.execution_id.clone(),
                attempt: record.attempt,
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn attempts(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ExecutionRecord>, AuditStoreError> {
        let mut attempts: Vec<ExecutionRecord> = self
            .records()
            .into_iter()
            .filter(|record| &record.execution_id == execution_id)
            .collect();
        attempts.sort_by_key(|record| record.attempt);
        Ok(attempts)
    }
}
