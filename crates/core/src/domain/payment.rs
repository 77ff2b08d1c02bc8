use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// One atomic transfer produced by resolving a rule. Items are scoped to a
/// single execution attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentItem {
    /// Position in resolution order. Policy prefixes and processor ordering
    /// are both defined over this sequence.
    pub sequence: u32,
    pub beneficiary_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub source_account: String,
    /// Collection member or invoice the item was expanded from, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl PaymentItem {
    pub fn item_ref(&self) -> String {
        format!("item-{}:{}", self.sequence, self.beneficiary_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    InvalidItem,
    InsufficientFunds,
    DailyLimitExceeded,
    RiskFlag,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidItem => "invalid_item",
            Self::InsufficientFunds => "insufficient_funds",
            Self::DailyLimitExceeded => "daily_limit_exceeded",
            Self::RiskFlag => "risk_flag",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    pub policy_type: PolicyType,
    pub item_ref: String,
    pub severity: Severity,
    pub reason: String,
}

/// Number of decimal places in the currency's minor unit.
pub fn minor_unit_scale(currency: &str) -> u32 {
    match currency.trim().to_ascii_uppercase().as_str() {
        "BTC" | "WBTC" => 8,
        "ETH" | "WETH" => 18,
        _ => 2,
    }
}

pub fn minor_unit(currency: &str) -> Decimal {
    Decimal::new(1, minor_unit_scale(currency))
}

pub fn round_to_minor_unit(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(minor_unit_scale(currency), RoundingStrategy::MidpointAwayFromZero)
}

/// Rounds toward zero, used when a remainder is assigned explicitly afterwards.
pub fn truncate_to_minor_unit(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(minor_unit_scale(currency), RoundingStrategy::ToZero)
}

pub fn total_amount(items: &[PaymentItem]) -> Decimal {
    items.iter().map(|item| item.amount).sum()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{minor_unit, round_to_minor_unit, truncate_to_minor_unit};

    #[test]
    fn minor_units_follow_currency() {
        assert_eq!(minor_unit("USDC"), Decimal::new(1, 2));
        assert_eq!(minor_unit("btc"), Decimal::new(1, 8));
        assert_eq!(round_to_minor_unit(Decimal::new(10_005, 3), "USD"), Decimal::new(1001, 2));
        assert_eq!(truncate_to_minor_unit(Decimal::new(33_339, 3), "USD"), Decimal::new(3333, 2));
    }
}
