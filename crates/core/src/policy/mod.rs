//! Batch policy validation.
//!
//! Every resolved item passes through four ordered tiers: structural checks,
//! account impact, the trailing 24h spending limit and risk screening. An item
//! rejected by one tier is excluded from the aggregate math of every later
//! tier. A batch with both approved and rejected items is a normal outcome;
//! the approved subset still goes to execution.

mod tiers;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::context::{ContextError, ContextProvider, FinancialSnapshot};
use crate::domain::execution::ChatId;
use crate::domain::payment::{total_amount, PaymentItem, PolicyType, PolicyViolation};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyValidationResult {
    /// True only when no tier produced a violation.
    pub success: bool,
    pub successful_items: Vec<PaymentItem>,
    pub failed_items: Vec<PaymentItem>,
    pub policy_violations: Vec<PolicyViolation>,
    pub audit_trail: PolicyAuditTrail,
}

impl PolicyValidationResult {
    pub fn violations_of(&self, policy_type: PolicyType) -> impl Iterator<Item = &PolicyViolation> {
        self.policy_violations.iter().filter(move |violation| violation.policy_type == policy_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAuditTrail {
    pub chat_id: ChatId,
    pub source_account: String,
    pub evaluated_at: DateTime<Utc>,
    pub batch_analysis: BatchAnalysis,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnalysis {
    pub total_items: usize,
    pub total_amount: Decimal,
    pub approved_items: usize,
    pub approved_amount: Decimal,
    pub rejected_items: usize,
    pub starting_balance: Option<Decimal>,
    pub projected_balance: Option<Decimal>,
    pub daily_spend_before: Decimal,
    pub daily_spend_after: Decimal,
    pub daily_limit: Decimal,
    /// Rejections per policy type, keyed by its wire name.
    pub rejections_by_policy: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct BatchPolicyValidator {
    provider: Arc<dyn ContextProvider>,
    config: PolicyConfig,
}

impl BatchPolicyValidator {
    pub fn new(provider: Arc<dyn ContextProvider>, config: PolicyConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn validate_payment_batch(
        &self,
        chat_id: &ChatId,
        items: &[PaymentItem],
        source_account: &str,
    ) -> Result<PolicyValidationResult, ContextError> {
        self.validate_payment_batch_at(chat_id, items, source_account, Utc::now())
    }

    /// Same as [`Self::validate_payment_batch`] with an explicit clock, so the
    /// 24h window and duplicate lookback are reproducible.
    pub fn validate_payment_batch_at(
        &self,
        chat_id: &ChatId,
        items: &[PaymentItem],
        source_account: &str,
        now: DateTime<Utc>,
    ) -> Result<PolicyValidationResult, ContextError> {
        let snapshot = self.provider.snapshot()?;
        Ok(validate_against(&snapshot, &self.config, chat_id, items, source_account, now))
    }
}

/// Runs the tiers against an explicit snapshot.
pub fn validate_against(
    snapshot: &FinancialSnapshot,
    config: &PolicyConfig,
    chat_id: &ChatId,
    items: &[PaymentItem],
    source_account: &str,
    now: DateTime<Utc>,
) -> PolicyValidationResult {
    let mut ordered = items.to_vec();
    ordered.sort_by_key(|item| item.sequence);

    let account = snapshot.account(source_account);
    let starting_balance = account.map(|account| account.balance);
    let daily_limit = account.and_then(|account| account.daily_limit).unwrap_or(config.default_daily_limit);
    let daily_spend_before = snapshot.spend_since(source_account, now - Duration::hours(24));

    let mut rejected = Vec::new();

    let tier = tiers::structural(ordered, snapshot, source_account, config);
    rejected.extend(tier.rejected);
    let tier = tiers::account_impact(tier.kept, starting_balance.unwrap_or(Decimal::ZERO));
    rejected.extend(tier.rejected);
    let tier = tiers::spending_limit(tier.kept, daily_spend_before, daily_limit);
    rejected.extend(tier.rejected);
    let tier = tiers::risk(tier.kept, snapshot, source_account, config, now);
    rejected.extend(tier.rejected);
    let successful_items = tier.kept;

    rejected.sort_by_key(|(item, _)| item.sequence);
    let mut rejections_by_policy = BTreeMap::new();
    for (_, violation) in &rejected {
        *rejections_by_policy.entry(violation.policy_type.as_str().to_string()).or_insert(0) += 1;
    }
    let (failed_items, policy_violations): (Vec<_>, Vec<_>) = rejected.into_iter().unzip();

    let approved_amount = total_amount(&successful_items);
    let batch_analysis = BatchAnalysis {
        total_items: items.len(),
        total_amount: total_amount(items),
        approved_items: successful_items.len(),
        approved_amount,
        rejected_items: failed_items.len(),
        starting_balance,
        projected_balance: starting_balance.map(|balance| balance - approved_amount),
        daily_spend_before,
        daily_spend_after: daily_spend_before + approved_amount,
        daily_limit,
        rejections_by_policy,
    };

    if policy_violations.is_empty() {
        info!(
            event_name = "pipeline.policy.approved",
            chat_id = %chat_id,
            items = successful_items.len(),
            "policy approved every item"
        );
    } else {
        warn!(
            event_name = "pipeline.policy.rejected_items",
            chat_id = %chat_id,
            approved = successful_items.len(),
            rejected = failed_items.len(),
            "policy rejected items"
        );
    }

    PolicyValidationResult {
        success: policy_violations.is_empty(),
        successful_items,
        failed_items,
        policy_violations,
        audit_trail: PolicyAuditTrail {
            chat_id: chat_id.clone(),
            source_account: source_account.to_string(),
            evaluated_at: now,
            batch_analysis,
        },
    }
}
