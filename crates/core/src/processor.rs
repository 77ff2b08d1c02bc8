//! Executes policy-approved payment items one by one. Items are independent:
//! a failed transfer is recorded and the batch carries on.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::execution::ChatId;
use crate::domain::payment::PaymentItem;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("source account `{0}` does not exist")]
    UnknownAccount(String),
    #[error("account `{account}` holds {expected}, item is in {actual}")]
    CurrencyMismatch { account: String, expected: String, actual: String },
    #[error("account `{account}` has {available} available, transfer needs {requested}")]
    InsufficientFunds { account: String, requested: Decimal, available: Decimal },
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("payment executor unavailable: {0}")]
    Unavailable(String),
}

impl TransferError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownAccount(_) => "unknown_account",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Rejected(_) => "rejected",
            Self::Unavailable(_) => "executor_unavailable",
        }
    }
}

/// Moves money for a single item. The in-memory dataset is the only
/// implementation shipped here; settlement against a real ledger plugs in at
/// this seam.
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    async fn execute(
        &self,
        chat_id: &ChatId,
        item: &PaymentItem,
    ) -> Result<TransferReceipt, TransferError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessfulPayment {
    pub item: PaymentItem,
    pub transfer_id: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayment {
    pub item: PaymentItem,
    pub error_code: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// True only when at least one item was submitted and every item succeeded.
    pub success: bool,
    pub successful_payments: Vec<SuccessfulPayment>,
    pub failed_payments: Vec<FailedPayment>,
    /// Sum of the amounts that actually moved.
    pub total_amount: Decimal,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn submitted(&self) -> usize {
        self.successful_payments.len() + self.failed_payments.len()
    }
}

#[derive(Clone)]
pub struct BatchPaymentProcessor {
    executor: Arc<dyn PaymentExecutor>,
}

impl BatchPaymentProcessor {
    pub fn new(executor: Arc<dyn PaymentExecutor>) -> Self {
        Self { executor }
    }

    /// Runs `approved_items` in resolution order. Items whose source differs
    /// from `source_account` fail individually without reaching the executor.
    pub async fn execute_batch(
        &self,
        chat_id: &ChatId,
        approved_items: &[PaymentItem],
        source_account: &str,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut successful_payments = Vec::new();
        let mut failed_payments = Vec::new();

        for item in approved_items {
            if !item.source_account.eq_ignore_ascii_case(source_account) {
                failed_payments.push(FailedPayment {
                    item: item.clone(),
                    error_code: "source_mismatch".to_string(),
                    error: format!(
                        "item source `{}` differs from batch source `{source_account}`",
                        item.source_account
                    ),
                });
                continue;
            }

            match self.executor.execute(chat_id, item).await {
                Ok(receipt) => successful_payments.push(SuccessfulPayment {
                    item: item.clone(),
                    transfer_id: receipt.transfer_id,
                    executed_at: receipt.executed_at,
                }),
                Err(error) => {
                    warn!(
                        event_name = "pipeline.execution.item_failed",
                        chat_id = %chat_id,
                        item_ref = %item.item_ref(),
                        error_code = error.code(),
                        error = %error,
                        "payment item failed"
                    );
                    failed_payments.push(FailedPayment {
                        item: item.clone(),
                        error_code: error.code().to_string(),
                        error: error.to_string(),
                    });
                }
            }
        }

        let total_amount = successful_payments.iter().map(|payment| payment.item.amount).sum();
        let success = !successful_payments.is_empty() && failed_payments.is_empty();
        let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            event_name = "pipeline.execution.completed",
            chat_id = %chat_id,
            succeeded = successful_payments.len(),
            failed = failed_payments.len(),
            execution_time_ms,
            "batch execution completed"
        );

        ExecutionResult {
            success,
            successful_payments,
            failed_payments,
            total_amount,
            execution_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{BatchPaymentProcessor, PaymentExecutor, TransferError, TransferReceipt};
    use crate::domain::execution::ChatId;
    use crate::domain::payment::PaymentItem;

    struct ScriptedExecutor {
        failing: BTreeSet<u32>,
        calls: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PaymentExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _chat_id: &ChatId,
            item: &PaymentItem,
        ) -> Result<TransferReceipt, TransferError> {
            self.calls.lock().expect("calls lock").push(item.sequence);
            if self.failing.contains(&item.sequence) {
                return Err(TransferError::Rejected("network timeout".to_string()));
            }
            Ok(TransferReceipt {
                transfer_id: format!("tx-{}", item.sequence),
                executed_at: Utc::now(),
            })
        }
    }

    fn items(count: u32) -> Vec<PaymentItem> {
        (1..=count)
            .map(|sequence| PaymentItem {
                sequence,
                beneficiary_id: format!("wallet-{sequence}"),
                amount: Decimal::new(100, 0),
                currency: "USDC".to_string(),
                source_account: "ops-account".to_string(),
                reference: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn one_failed_item_does_not_abort_the_batch() {
        let executor = Arc::new(ScriptedExecutor {
            failing: BTreeSet::from([3]),
            calls: Mutex::new(Vec::new()),
        });
        let processor = BatchPaymentProcessor::new(executor.clone());

        let result =
            processor.execute_batch(&ChatId("chat-1".to_string()), &items(5), "ops-account").await;

        assert!(!result.success);
        assert_eq!(result.successful_payments.len(), 4);
        assert_eq!(result.failed_payments.len(), 1);
        assert_eq!(result.failed_payments[0].item.sequence, 3);
        assert_eq!(result.failed_payments[0].error_code, "rejected");
        assert_eq!(result.total_amount, Decimal::new(400, 0));
        assert_eq!(*executor.calls.lock().expect("calls lock"), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn all_items_succeeding_reports_success() {
        let executor =
            Arc::new(ScriptedExecutor { failing: BTreeSet::new(), calls: Mutex::new(Vec::new()) });
        let processor = BatchPaymentProcessor::new(executor);

        let result =
            processor.execute_batch(&ChatId("chat-1".to_string()), &items(2), "ops-account").await;

        assert!(result.success);
        assert_eq!(result.submitted(), 2);
        assert_eq!(result.successful_payments[1].transfer_id, "tx-2");
    }

    #[tokio::test]
    async fn empty_and_mismatched_batches_do_not_succeed() {
        let executor =
            Arc::new(ScriptedExecutor { failing: BTreeSet::new(), calls: Mutex::new(Vec::new()) });
        let processor = BatchPaymentProcessor::new(executor.clone());
        let chat = ChatId("chat-1".to_string());

        let empty = processor.execute_batch(&chat, &[], "ops-account").await;
        assert!(!empty.success);
        assert_eq!(empty.submitted(), 0);

        let mismatched = processor.execute_batch(&chat, &items(1), "payroll").await;
        assert_eq!(mismatched.failed_payments[0].error_code, "source_mismatch");
        assert!(executor.calls.lock().expect("calls lock").is_empty());
    }
}
