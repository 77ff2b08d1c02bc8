//! The four ordered policy tiers. Each tier receives the items still approved
//! after the previous tiers and returns the ones it keeps; running totals are
//! reduced in resolution order.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::config::PolicyConfig;
use crate::context::{normalize_key, Account, FinancialSnapshot};
use crate::domain::payment::{PaymentItem, PolicyType, PolicyViolation, Severity};

pub(super) struct TierOutcome {
    pub kept: Vec<PaymentItem>,
    pub rejected: Vec<(PaymentItem, PolicyViolation)>,
}

impl TierOutcome {
    fn new() -> Self {
        Self { kept: Vec::new(), rejected: Vec::new() }
    }

    fn reject(&mut self, item: PaymentItem, policy_type: PolicyType, severity: Severity, reason: String) {
        let violation = PolicyViolation { policy_type, item_ref: item.item_ref(), severity, reason };
        self.rejected.push((item, violation));
    }
}

/// Tier 1: per-item shape checks.
pub(super) fn structural(
    items: Vec<PaymentItem>,
    snapshot: &FinancialSnapshot,
    source_account: &str,
    config: &PolicyConfig,
) -> TierOutcome {
    let account = snapshot.account(source_account);
    let mut outcome = TierOutcome::new();

    for item in items {
        match structural_problem(&item, account, snapshot, source_account, config) {
            Some(reason) => {
                outcome.reject(item, PolicyType::InvalidItem, Severity::High, reason);
            }
            None => outcome.kept.push(item),
        }
    }
    outcome
}

fn structural_problem(
    item: &PaymentItem,
    account: Option<&Account>,
    snapshot: &FinancialSnapshot,
    source_account: &str,
    config: &PolicyConfig,
) -> Option<String> {
    if item.amount <= Decimal::ZERO {
        return Some(format!("amount {} must be positive", item.amount));
    }
    if !config.supports_currency(&item.currency) {
        return Some(format!("currency `{}` is not supported", item.currency));
    }
    if normalize_key(&item.source_account) != normalize_key(source_account) {
        return Some(format!(
            "item source `{}` differs from batch source `{source_account}`",
            item.source_account
        ));
    }
    let Some(account) = account else {
        return Some(format!("source account `{source_account}` does not exist"));
    };
    if !account.currency.eq_ignore_ascii_case(&item.currency) {
        return Some(format!(
            "account `{}` holds {}, item is in {}",
            account.id, account.currency, item.currency
        ));
    }

    let beneficiary = item.beneficiary_id.trim();
    if beneficiary.is_empty() {
        return Some("beneficiary is empty".to_string());
    }
    match snapshot.beneficiary(beneficiary) {
        Some(known) if !known.active => Some(format!("beneficiary `{beneficiary}` is inactive")),
        Some(_) => None,
        None if config.allow_unlisted_beneficiaries => None,
        None => Some(format!("beneficiary `{beneficiary}` is not a listed beneficiary")),
    }
}

/// Tier 2: the running post-batch balance must stay non-negative. The maximal
/// affordable prefix is kept and everything after the first overdraft is
/// rejected.
pub(super) fn account_impact(items: Vec<PaymentItem>, balance: Decimal) -> TierOutcome {
    let mut outcome = TierOutcome::new();
    let mut running = Decimal::ZERO;
    let mut exhausted = false;

    for item in items {
        if !exhausted && running + item.amount <= balance {
            running += item.amount;
            outcome.kept.push(item);
            continue;
        }
        exhausted = true;
        let reason = format!(
            "balance {balance} cannot cover {} after {running} already approved",
            item.amount
        );
        outcome.reject(item, PolicyType::InsufficientFunds, Severity::Critical, reason);
    }
    outcome
}

/// Tier 3: trailing 24h spend including this batch must stay within `limit`.
pub(super) fn spending_limit(
    items: Vec<PaymentItem>,
    spent_before: Decimal,
    limit: Decimal,
) -> TierOutcome {
    let mut outcome = TierOutcome::new();
    let mut running = spent_before;
    let mut exceeded = false;

    for item in items {
        if !exceeded && running + item.amount <= limit {
            running += item.amount;
            outcome.kept.push(item);
            continue;
        }
        exceeded = true;
        let reason = format!(
            "24h spend would reach {} against a daily limit of {limit}",
            running + item.amount
        );
        outcome.reject(item, PolicyType::DailyLimitExceeded, Severity::High, reason);
    }
    outcome
}

/// Tier 4: duplicates of recent transfers or of earlier items in this batch,
/// and amounts above the large-transaction threshold.
pub(super) fn risk(
    items: Vec<PaymentItem>,
    snapshot: &FinancialSnapshot,
    source_account: &str,
    config: &PolicyConfig,
    now: DateTime<Utc>,
) -> TierOutcome {
    let lookback = i64::try_from(config.duplicate_lookback_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    let since = now.checked_sub_signed(lookback).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut seen: BTreeSet<(String, Decimal)> = snapshot
        .transfers_since(source_account, since)
        .map(|transfer| (normalize_key(&transfer.beneficiary_id), transfer.amount.normalize()))
        .collect();

    let mut outcome = TierOutcome::new();
    for item in items {
        if item.amount > config.large_transaction_threshold {
            let reason = format!(
                "amount {} exceeds the large-transaction threshold of {}",
                item.amount, config.large_transaction_threshold
            );
            outcome.reject(item, PolicyType::RiskFlag, Severity::Medium, reason);
            continue;
        }

        let key = (normalize_key(&item.beneficiary_id), item.amount.normalize());
        if !seen.insert(key) {
            let reason = format!(
                "duplicate payment of {} to `{}` within the lookback window",
                item.amount, item.beneficiary_id
            );
            outcome.reject(item, PolicyType::RiskFlag, Severity::Medium, reason);
            continue;
        }
        outcome.kept.push(item);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{account_impact, spending_limit};
    use crate::domain::payment::{PaymentItem, PolicyType};

    fn items(amounts: &[i64]) -> Vec<PaymentItem> {
        amounts
            .iter()
            .enumerate()
            .map(|(index, amount)| PaymentItem {
                sequence: u32::try_from(index + 1).expect("small index"),
                beneficiary_id: format!("wallet-{index}"),
                amount: Decimal::new(*amount, 0),
                currency: "USDC".to_string(),
                source_account: "ops-account".to_string(),
                reference: None,
            })
            .collect()
    }

    #[test]
    fn account_impact_keeps_the_affordable_prefix_only() {
        // The third item would fit on its own but follows an overdraft.
        let outcome = account_impact(items(&[400, 700, 50]), Decimal::new(1_000, 0));

        let kept: Vec<u32> = outcome.kept.iter().map(|item| item.sequence).collect();
        assert_eq!(kept, vec![1]);
        assert_eq!(outcome.rejected.len(), 2);
        assert!(outcome
            .rejected
            .iter()
            .all(|(_, violation)| violation.policy_type == PolicyType::InsufficientFunds));
    }

    #[test]
    fn spending_limit_counts_prior_spend() {
        let outcome =
            spending_limit(items(&[300, 300]), Decimal::new(500, 0), Decimal::new(1_000, 0));

        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.rejected[0].1.item_ref, "item-2:wallet-1");
        assert!(outcome.rejected[0].1.reason.contains("1100"));
    }
}
