//! Orchestrates one execution attempt: resolution, policy validation, batch
//! execution, then an append to the audit store.
//!
//! `execute` never fails. Every outcome, including a malformed payload or an
//! unavailable dataset, is carried by the returned record's status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::audit::{AuditStore, AuditTrailBuilder, ExecutionRecord};
use crate::config::AppConfig;
use crate::context::ContextProvider;
use crate::domain::execution::{ChatId, ExecutionId};
use crate::domain::rule::RuleData;
use crate::policy::{BatchPolicyValidator, PolicyValidationResult};
use crate::processor::{BatchPaymentProcessor, PaymentExecutor};
use crate::resolver::{IssueCode, PaymentResolver, ResolutionResult};

/// Fault records written while prior attempts are unreadable take attempt
/// numbers from this mark upward, so they never collide with a real attempt.
pub const FAULT_ATTEMPT_BASE: u32 = 1 << 31;

fn fault_attempt() -> u32 {
    let offset = Utc::now().timestamp_millis().rem_euclid(i64::from(FAULT_ATTEMPT_BASE));
    FAULT_ATTEMPT_BASE + u32::try_from(offset).unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub execution_id: Option<ExecutionId>,
    pub chat_id: ChatId,
    pub rule: RuleData,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct InvalidRequest {
    pub execution_id: Option<ExecutionId>,
    pub chat_id: Option<ChatId>,
    pub reason: String,
}

impl ExecuteRequest {
    /// Reads `{ chatId, ruleData, executionId? }`. Whatever identifiers could
    /// be read are kept on the error so the attempt is still attributable.
    pub fn from_payload(payload: &Value) -> Result<Self, InvalidRequest> {
        let Some(object) = payload.as_object() else {
            return Err(InvalidRequest {
                execution_id: None,
                chat_id: None,
                reason: "payload must be a JSON object".to_string(),
            });
        };

        let execution_id = match object.get("executionId") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(id)) if !id.trim().is_empty() => {
                Ok(Some(ExecutionId(id.trim().to_string())))
            }
            Some(_) => Err("executionId must be a non-empty string".to_string()),
        };
        let chat_id = match object.get("chatId") {
            None | Some(Value::Null) => Err("chatId is required".to_string()),
            Some(Value::String(id)) if !id.trim().is_empty() => Ok(ChatId(id.trim().to_string())),
            Some(_) => Err("chatId must be a non-empty string".to_string()),
        };
        let rule = match object.get("ruleData") {
            None | Some(Value::Null) => Err("ruleData is required".to_string()),
            Some(raw) => serde_json::from_value::<RuleData>(raw.clone())
                .map_err(|error| format!("ruleData is malformed: {error}")),
        };

        match (execution_id, chat_id, rule) {
            (Ok(execution_id), Ok(chat_id), Ok(rule)) => Ok(Self { execution_id, chat_id, rule }),
            (execution_id, chat_id, rule) => {
                let reason = [execution_id.as_ref().err(), chat_id.as_ref().err(), rule.as_ref().err()]
                    .into_iter()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(InvalidRequest {
                    execution_id: execution_id.ok().flatten(),
                    chat_id: chat_id.ok(),
                    reason,
                })
            }
        }
    }
}

/// Body of the `POST /execute` answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub chat_id: ChatId,
    pub execution: ExecutionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Resolution and policy outcome without moving funds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRun {
    pub resolution: ResolutionResult,
    pub policy: Option<PolicyValidationResult>,
}

struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self { started: Instant::now(), budget }
    }

    fn exceeded(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

#[derive(Clone)]
pub struct ExecutionPipeline {
    resolver: PaymentResolver,
    validator: BatchPolicyValidator,
    processor: BatchPaymentProcessor,
    store: Arc<dyn AuditStore>,
    timeout: Duration,
}

impl ExecutionPipeline {
    pub fn new(
        resolver: PaymentResolver,
        validator: BatchPolicyValidator,
        processor: BatchPaymentProcessor,
        store: Arc<dyn AuditStore>,
        timeout: Duration,
    ) -> Self {
        Self { resolver, validator, processor, store, timeout }
    }

    /// Wires every stage to one dataset that both provides context and moves
    /// funds.
    pub fn from_config<D>(config: &AppConfig, dataset: Arc<D>, store: Arc<dyn AuditStore>) -> Self
    where
        D: ContextProvider + PaymentExecutor + 'static,
    {
        let provider: Arc<dyn ContextProvider> = dataset.clone();
        let executor: Arc<dyn PaymentExecutor> = dataset;
        Self::new(
            PaymentResolver::new(provider.clone()),
            BatchPolicyValidator::new(provider, config.policy.clone()),
            BatchPaymentProcessor::new(executor),
            store,
            Duration::from_secs(config.pipeline.timeout_secs),
        )
    }

    pub async fn execute(&self, payload: &Value) -> ExecuteResponse {
        let (execution_id, chat_id, request) = match ExecuteRequest::from_payload(payload) {
            Ok(request) => (
                request.execution_id.clone().unwrap_or_else(ExecutionId::generate),
                request.chat_id.clone(),
                Ok(request.rule),
            ),
            Err(invalid) => (
                invalid.execution_id.unwrap_or_else(ExecutionId::generate),
                invalid.chat_id.unwrap_or_else(ChatId::unknown),
                Err(invalid.reason),
            ),
        };

        let record = self.run(execution_id, chat_id.clone(), request).await;
        let mut message = (!record.status.is_ok()).then(|| record.summary.clone());

        if let Err(persist_error) = self.store.append(&record).await {
            error!(
                event_name = "pipeline.audit.persist_failed",
                correlation_id = %record.execution_id,
                chat_id = %record.chat_id,
                attempt = record.attempt,
                error = %persist_error,
                "execution record could not be persisted"
            );
            let note = format!("audit record not persisted: {persist_error}");
            message = Some(match message {
                Some(existing) => format!("{existing}; {note}"),
                None => note,
            });
        } else {
            info!(
                event_name = "pipeline.audit.recorded",
                correlation_id = %record.execution_id,
                chat_id = %record.chat_id,
                attempt = record.attempt,
                status = record.status.as_str(),
                "execution record appended"
            );
        }

        ExecuteResponse { success: record.status.is_ok(), chat_id, execution: record, message }
    }

    /// Resolution and policy only, against the current dataset state.
    pub fn dry_run(&self, chat_id: &ChatId, rule: &RuleData) -> DryRun {
        let resolution = self.resolver.resolve_payments(rule);
        let policy = if resolution.success && !resolution.payment_items.is_empty() {
            self.validator
                .validate_payment_batch(chat_id, &resolution.payment_items, &rule.payment.source)
                .ok()
        } else {
            None
        };
        DryRun { resolution, policy }
    }

    async fn run(
        &self,
        execution_id: ExecutionId,
        chat_id: ChatId,
        request: Result<RuleData, String>,
    ) -> ExecutionRecord {
        let deadline = Deadline::start(self.timeout);
        let builder = AuditTrailBuilder::new(execution_id.clone(), chat_id.clone());

        let previous = match self.store.attempts(&execution_id).await {
            Ok(previous) => previous,
            Err(store_error) => {
                let attempt = fault_attempt();
                warn!(
                    event_name = "pipeline.audit.lookup_failed",
                    correlation_id = %execution_id,
                    chat_id = %chat_id,
                    attempt,
                    error = %store_error,
                    "prior attempts could not be read"
                );
                return builder
                    .attempt(attempt)
                    .fault(format!(
                        "prior attempts could not be read: {store_error}; recorded as attempt {attempt}"
                    ))
                    .build();
            }
        };
        let attempt = previous
            .iter()
            .map(|record| record.attempt)
            .filter(|attempt| *attempt < FAULT_ATTEMPT_BASE)
            .max()
            .unwrap_or(0)
            + 1;
        let builder = builder.attempt(attempt);

        let rule = match request {
            Ok(rule) => rule,
            Err(reason) => {
                warn!(
                    event_name = "pipeline.request.invalid",
                    correlation_id = %execution_id,
                    chat_id = %chat_id,
                    reason = %reason,
                    "rejected malformed execution request"
                );
                return builder.invalid_request(reason).build();
            }
        };

        if let Some(prior) = previous.iter().find(|record| record.moved_funds()) {
            warn!(
                event_name = "pipeline.execution.duplicate",
                correlation_id = %execution_id,
                chat_id = %chat_id,
                attempt,
                replay_of = prior.attempt,
                "execution already moved funds; replay recorded without executing"
            );
            return builder.replay_of(prior.attempt).build();
        }

        info!(
            event_name = "pipeline.execution.started",
            correlation_id = %execution_id,
            chat_id = %chat_id,
            attempt,
            action = rule.payment.action.as_str(),
            source_account = %rule.payment.source,
            "execution attempt started"
        );

        let resolution = self.resolver.resolve_payments(&rule);
        info!(
            event_name = "pipeline.resolution.completed",
            correlation_id = %execution_id,
            chat_id = %chat_id,
            success = resolution.success,
            items = resolution.payment_items.len(),
            total_amount = %resolution.total_amount,
            unmet_conditions = resolution.unmet_conditions.len(),
            "payment resolution completed"
        );

        let context_down = resolution
            .errors
            .iter()
            .find(|issue| issue.code == IssueCode::ContextUnavailableError)
            .map(|issue| issue.message.clone());
        let builder = builder.resolution(resolution.clone());
        if let Some(reason) = context_down {
            return builder.fault(reason).build();
        }
        if !resolution.success || resolution.condition_not_met() {
            return builder.build();
        }

        if deadline.exceeded() {
            return self.timed_out(builder, &execution_id, &chat_id, "policy validation");
        }
        let source_account = rule.payment.source.as_str();
        let policy = match self.validator.validate_payment_batch(
            &chat_id,
            &resolution.payment_items,
            source_account,
        ) {
            Ok(policy) => policy,
            Err(context_error) => return builder.fault(context_error.to_string()).build(),
        };
        let builder = builder.policy(policy.clone());
        if policy.successful_items.is_empty() {
            return builder.build();
        }

        if deadline.exceeded() {
            return self.timed_out(builder, &execution_id, &chat_id, "batch execution");
        }
        let execution =
            self.processor.execute_batch(&chat_id, &policy.successful_items, source_account).await;
        builder.execution(execution).build()
    }

    fn timed_out(
        &self,
        builder: AuditTrailBuilder,
        execution_id: &ExecutionId,
        chat_id: &ChatId,
        stage: &str,
    ) -> ExecutionRecord {
        warn!(
            event_name = "pipeline.deadline.exceeded",
            correlation_id = %execution_id,
            chat_id = %chat_id,
            stage,
            budget_secs = self.timeout.as_secs(),
            "execution budget exhausted"
        );
        builder
            .fault(format!(
                "deadline of {}s exceeded before {stage}",
                self.timeout.as_secs()
            ))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{ExecuteRequest, ExecutionPipeline, FAULT_ATTEMPT_BASE};
    use crate::audit::{AuditStore, AuditStoreError, ExecutionRecord, InMemoryAuditStore};
    use crate::config::AppConfig;
    use crate::context::{ContextError, ContextProvider, FinancialSnapshot, InMemoryFinancialDataset};
    use crate::domain::execution::{ExecutionId, ExecutionStatus};
    use crate::policy::BatchPolicyValidator;
    use crate::processor::BatchPaymentProcessor;
    use crate::resolver::PaymentResolver;

    fn pipeline() -> (ExecutionPipeline, Arc<InMemoryFinancialDataset>, InMemoryAuditStore) {
        let dataset = Arc::new(InMemoryFinancialDataset::demo());
        let store = InMemoryAuditStore::default();
        let pipeline =
            ExecutionPipeline::from_config(&AppConfig::default(), dataset.clone(), Arc::new(store.clone()));
        (pipeline, dataset, store)
    }

    fn simple_payload(amount: i64) -> serde_json::Value {
        json!({
            "chatId": "chat-ops",
            "ruleData": {
                "payment": {
                    "action": "simple",
                    "source": "ops-account",
                    "amount": amount,
                    "currency": "USDC",
                    "beneficiary": ["wallet-A"]
                },
                "execution": { "timing": "once" }
            }
        })
    }

    #[test]
    fn payload_errors_keep_whatever_identifiers_were_readable() {
        let error = ExecuteRequest::from_payload(&json!({ "executionId": "exec-7", "ruleData": 4 }))
            .expect_err("invalid");

        assert_eq!(error.execution_id, Some(ExecutionId("exec-7".to_string())));
        assert!(error.chat_id.is_none());
        assert!(error.reason.contains("chatId is required"));
        assert!(error.reason.contains("ruleData is malformed"));
    }

    #[tokio::test]
    async fn simple_rule_executes_and_is_audited() {
        let (pipeline, dataset, store) = pipeline();

        let response = pipeline.execute(&simple_payload(500)).await;

        assert!(response.success);
        assert_eq!(response.execution.status, ExecutionStatus::Success);
        assert!(response.message.is_none());
        let execution = response.execution.execution_result.as_ref().expect("execution result");
        assert_eq!(execution.successful_payments.len(), 1);
        assert_eq!(dataset.balance("ops-account"), Some(Decimal::new(249_500, 0)));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn missing_chat_id_is_an_invalid_request_without_resolution() {
        let (pipeline, dataset, store) = pipeline();

        let response = pipeline
            .execute(&json!({ "ruleData": simple_payload(500)["ruleData"].clone() }))
            .await;

        assert!(!response.success);
        assert_eq!(response.chat_id.0, "unknown");
        assert_eq!(response.execution.status, ExecutionStatus::InvalidRequest);
        assert!(response.execution.resolution_result.is_none());
        assert!(response.message.as_deref().is_some_and(|message| message.contains("chatId")));
        assert_eq!(dataset.transfer_count(), 0);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn replays_of_a_paid_execution_do_not_pay_twice() {
        let (pipeline, dataset, store) = pipeline();
        let mut payload = simple_payload(500);
        payload["executionId"] = json!("delivery-42");

        let first = pipeline.execute(&payload).await;
        let second = pipeline.execute(&payload).await;

        assert_eq!(first.execution.status, ExecutionStatus::Success);
        assert_eq!(second.execution.status, ExecutionStatus::DuplicateExecution);
        assert_eq!(second.execution.attempt, 2);
        assert_eq!(second.execution.replay_of, Some(1));
        assert_eq!(dataset.transfer_count(), 1);

        let attempts = store
            .attempts(&ExecutionId("delivery-42".to_string()))
            .await
            .expect("attempts");
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn unmet_condition_is_a_no_op() {
        let (pipeline, dataset, _) = pipeline();
        let mut payload = simple_payload(500);
        payload["ruleData"]["conditions"] = json!([
            { "source": "accounts", "field": "balance", "operator": ">=", "value": 1_000_000 }
        ]);

        let response = pipeline.execute(&payload).await;

        assert_eq!(response.execution.status, ExecutionStatus::ConditionNotMet);
        let resolution = response.execution.resolution_result.as_ref().expect("resolution");
        assert!(resolution.success);
        assert!(resolution.payment_items.is_empty());
        assert!(response.execution.policy_result.is_none());
        assert_eq!(dataset.transfer_count(), 0);
    }

    #[tokio::test]
    async fn partial_policy_approval_is_a_violation_with_the_paid_items_attached() {
        let (pipeline, dataset, store) = pipeline();
        let payload = json!({
            "chatId": "chat-ops",
            "executionId": "delivery-split",
            "ruleData": {
                "payment": {
                    "action": "split",
                    "source": "ops-account",
                    "amount": 100000,
                    "currency": "USDC",
                    "beneficiary": ["wallet-A", "wallet-B"],
                    "percentages": [30, 70]
                },
                "execution": { "timing": "once" }
            }
        });

        let response = pipeline.execute(&payload).await;

        assert_eq!(response.execution.status, ExecutionStatus::PolicyViolation);
        assert!(!response.success);
        assert!(response
            .message
            .as_deref()
            .is_some_and(|message| message.contains("policy rejected 1 of 2")));
        let policy = response.execution.policy_result.as_ref().expect("policy");
        assert!(!policy.success);
        assert_eq!(policy.successful_items.len(), 1);
        assert_eq!(policy.failed_items.len(), 1);
        let execution = response.execution.execution_result.as_ref().expect("execution result");
        assert_eq!(execution.successful_payments.len(), 1);
        assert_eq!(execution.successful_payments[0].item.beneficiary_id, "wallet-A");
        assert_eq!(dataset.transfer_count(), 1);

        // The approved item was paid, so a redelivery must not pay it again.
        let replay = pipeline.execute(&payload).await;
        assert_eq!(replay.execution.status, ExecutionStatus::DuplicateExecution);
        assert_eq!(replay.execution.replay_of, Some(1));
        assert_eq!(dataset.transfer_count(), 1);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_budget_stops_before_moving_funds() {
        let dataset = Arc::new(InMemoryFinancialDataset::demo());
        let mut config = AppConfig::default();
        config.pipeline.timeout_secs = 0;
        let pipeline =
            ExecutionPipeline::from_config(&config, dataset.clone(), Arc::new(InMemoryAuditStore::default()));

        let response = pipeline.execute(&simple_payload(500)).await;

        assert_eq!(response.execution.status, ExecutionStatus::ExecutionFailed);
        assert!(response.execution.summary.contains("deadline"));
        assert_eq!(dataset.transfer_count(), 0);
    }

    #[derive(Default)]
    struct UnreadableStore {
        inner: InMemoryAuditStore,
        lookups_fail: AtomicBool,
    }

    #[async_trait]
    impl AuditStore for UnreadableStore {
        async fn append(&self, record: &ExecutionRecord) -> Result<(), AuditStoreError> {
            self.inner.append(record).await
        }

        async fn attempts(
            &self,
            execution_id: &ExecutionId,
        ) -> Result<Vec<ExecutionRecord>, AuditStoreError> {
            if self.lookups_fail.load(Ordering::SeqCst) {
                return Err(AuditStoreError::Storage("replica lagging".to_string()));
            }
            self.inner.attempts(execution_id).await
        }
    }

    #[tokio::test]
    async fn unreadable_history_faults_get_their_own_attempt_numbers() {
        let dataset = Arc::new(InMemoryFinancialDataset::demo());
        let store = Arc::new(UnreadableStore::default());
        store.lookups_fail.store(true, Ordering::SeqCst);
        let pipeline = ExecutionPipeline::from_config(&AppConfig::default(), dataset.clone(), store.clone());
        let mut payload = simple_payload(500);
        payload["executionId"] = json!("delivery-9");

        let first = pipeline.execute(&payload).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = pipeline.execute(&payload).await;

        for response in [&first, &second] {
            assert_eq!(response.execution.status, ExecutionStatus::ExecutionFailed);
            assert!(response.execution.attempt >= FAULT_ATTEMPT_BASE);
            assert!(response
                .message
                .as_deref()
                .is_some_and(|message| message.contains("prior attempts could not be read")));
            assert!(!response.message.as_deref().unwrap_or_default().contains("not persisted"));
        }
        assert_ne!(first.execution.attempt, second.execution.attempt);
        assert_eq!(store.inner.records().len(), 2);
        assert_eq!(dataset.transfer_count(), 0);

        // Once history is readable again, numbering resumes below the fault range.
        store.lookups_fail.store(false, Ordering::SeqCst);
        let recovered = pipeline.execute(&payload).await;
        assert_eq!(recovered.execution.status, ExecutionStatus::Success);
        assert_eq!(recovered.execution.attempt, 1);
        assert_eq!(store.inner.records().len(), 3);
    }

    struct OfflineProvider;

    impl ContextProvider for OfflineProvider {
        fn snapshot(&self) -> Result<FinancialSnapshot, ContextError> {
            Err(ContextError::Unavailable("ledger offline".to_string()))
        }
    }

    #[tokio::test]
    async fn unavailable_context_is_an_execution_failure() {
        let provider: Arc<dyn ContextProvider> = Arc::new(OfflineProvider);
        let dataset = Arc::new(InMemoryFinancialDataset::demo());
        let pipeline = ExecutionPipeline::new(
            PaymentResolver::new(provider.clone()),
            BatchPolicyValidator::new(provider, AppConfig::default().policy),
            BatchPaymentProcessor::new(dataset.clone()),
            Arc::new(InMemoryAuditStore::default()),
            Duration::from_secs(30),
        );

        let response = pipeline.execute(&simple_payload(500)).await;

        assert_eq!(response.execution.status, ExecutionStatus::ExecutionFailed);
        assert!(response.execution.summary.contains("ledger offline"));
        assert_eq!(dataset.transfer_count(), 0);
    }
}
