use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declarative payment instruction. Accepted rules are never mutated; every
/// execution attempt re-resolves the same rule against the current dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleData {
    pub payment: PaymentSpec,
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub memo: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    Simple,
    Split,
    Batch,
    Leftover,
    Calculation,
}

impl PaymentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Split => "split",
            Self::Batch => "batch",
            Self::Leftover => "leftover",
            Self::Calculation => "calculation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSpec {
    pub action: PaymentAction,
    pub source: String,
    #[serde(default)]
    pub amount: Option<AmountSpec>,
    pub currency: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub beneficiary: Vec<String>,
    #[serde(default)]
    pub percentages: Option<Vec<Decimal>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl PaymentSpec {
    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or(&[])
    }
}

/// The amount shape is decided once, at parse time. Downstream code matches on
/// the variant and never inspects raw JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAmount", into = "RawAmount")]
pub enum AmountSpec {
    Fixed(Decimal),
    Sourced { source: String, formula: Option<String> },
}

impl AmountSpec {
    pub fn formula(&self) -> Option<&str> {
        match self {
            Self::Fixed(_) => None,
            Self::Sourced { formula, .. } => formula.as_deref(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(serde_json::Number),
    Text(String),
    Sourced {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        formula: Option<String>,
    },
}

impl TryFrom<RawAmount> for AmountSpec {
    type Error = String;

    fn try_from(raw: RawAmount) -> Result<Self, Self::Error> {
        match raw {
            RawAmount::Number(number) => Decimal::from_str(&number.to_string())
                .or_else(|_| Decimal::from_scientific(&number.to_string()))
                .map(Self::Fixed)
                .map_err(|error| format!("amount `{number}` is not a valid decimal: {error}")),
            RawAmount::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err("amount must not be empty".to_string());
                }
                match Decimal::from_str(trimmed) {
                    Ok(value) => Ok(Self::Fixed(value)),
                    Err(_) => Ok(Self::Sourced { source: trimmed.to_string(), formula: None }),
                }
            }
            RawAmount::Sourced { source, formula } => Ok(Self::Sourced {
                source: source.trim().to_string(),
                formula: formula.map(|value| value.trim().to_string()).filter(|f| !f.is_empty()),
            }),
        }
    }
}

impl From<AmountSpec> for RawAmount {
    fn from(value: AmountSpec) -> Self {
        match value {
            AmountSpec::Fixed(amount) => RawAmount::Text(amount.normalize().to_string()),
            AmountSpec::Sourced { source, formula } => RawAmount::Sourced { source, formula },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTiming {
    Once,
    Schedule,
    Hook,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub timing: ExecutionTiming,
    #[serde(default)]
    pub at: Option<i64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub hooks: Option<Vec<String>>,
}

impl ExecutionSpec {
    pub fn immediate() -> Self {
        Self { timing: ExecutionTiming::Once, at: None, cron: None, hooks: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub source: String,
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}
