//! Guard conditions evaluated against the snapshot before any amount is
//! computed.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use super::normalize_key;
use super::resolver::{ContextResolver, ResolvedValue, UnknownReferenceError};
use crate::domain::rule::{Condition, ConditionOperator};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error(transparent)]
    UnknownReference(#[from] UnknownReferenceError),
    #[error("condition on `{target}.{field}` is invalid: {detail}")]
    Invalid { target: String, field: String, detail: String },
}

/// The value a condition was compared against, kept for audit messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Number(Decimal),
    Text(String),
    List(Vec<String>),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{}", value.normalize()),
            Self::Text(value) => write!(f, "\"{value}\""),
            Self::List(values) => write!(f, "[{}]", values.join(", ")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub met: bool,
    pub actual: Operand,
}

impl ConditionOutcome {
    pub fn describe(&self, condition: &Condition) -> String {
        format!(
            "condition `{}.{} {} {}` not met (actual {})",
            condition.source, condition.field, condition.operator, condition.value, self.actual
        )
    }
}

/// Evaluates one condition. `source_account` is the rule's paying account and
/// is what a bare `accounts` source refers to.
pub fn evaluate(
    resolver: &ContextResolver<'_>,
    condition: &Condition,
    source_account: &str,
) -> Result<ConditionOutcome, ConditionError> {
    let actual = target_value(resolver, condition, source_account)?;
    let met = compare(&actual, condition)?;
    Ok(ConditionOutcome { met, actual })
}

fn target_value(
    resolver: &ContextResolver<'_>,
    condition: &Condition,
    source_account: &str,
) -> Result<Operand, ConditionError> {
    let source = condition.source.trim();
    let field = condition.field.trim();
    let key = normalize_key(source);

    let path = if key == "accounts" || key == "account" {
        format!("accounts.{source_account}.{field}")
    } else if key == "treasury" || key.starts_with("accounts.") || key.starts_with("account.") {
        format!("{source}.{field}")
    } else if let Some(members) = resolver.members_of(source) {
        return aggregate(&members, condition);
    } else {
        format!("{source}.{field}")
    };

    match resolver.resolve(&path)? {
        ResolvedValue::Number(value) => Ok(Operand::Number(value)),
        ResolvedValue::Text(value) => Ok(Operand::Text(value)),
        ResolvedValue::Members(_) | ResolvedValue::Literal(_) => Err(invalid(
            condition,
            "condition target must be a field, not a collection",
        )),
    }
}

fn aggregate(
    members: &[super::Member],
    condition: &Condition,
) -> Result<Operand, ConditionError> {
    let field = condition.field.trim();
    if normalize_key(field) == "count" {
        return Ok(Operand::Number(Decimal::from(members.len())));
    }

    if members.iter().any(|member| member.fields.contains_key(field)) {
        let total: Decimal = members.iter().filter_map(|member| member.fields.get(field)).sum();
        return Ok(Operand::Number(total));
    }

    let texts: Vec<String> = members
        .iter()
        .filter_map(|member| {
            member
                .text_fields
                .get(field)
                .cloned()
                .or_else(|| (field == "tags").then(|| member.tags.join(",")))
        })
        .collect();
    if texts.is_empty() && !members.is_empty() {
        return Err(UnknownReferenceError {
            reference: format!("{}.{}", condition.source, field),
            detail: format!("no member has field `{field}`"),
        }
        .into());
    }
    Ok(Operand::List(texts))
}

fn compare(actual: &Operand, condition: &Condition) -> Result<bool, ConditionError> {
    let expected = &condition.value;
    match condition.operator {
        ConditionOperator::Eq | ConditionOperator::NotEq => {
            let equal = match actual {
                Operand::Number(number) => {
                    let other = as_decimal(expected)
                        .ok_or_else(|| invalid(condition, "expected a numeric value"))?;
                    *number == other
                }
                Operand::Text(text) => {
                    let other = as_text(expected)
                        .ok_or_else(|| invalid(condition, "expected a scalar value"))?;
                    normalize_key(text) == normalize_key(&other)
                }
                Operand::List(_) => {
                    return Err(invalid(condition, "equality is not defined for a list"));
                }
            };
            Ok(equal == (condition.operator == ConditionOperator::Eq))
        }
        ConditionOperator::Gt
        | ConditionOperator::Gte
        | ConditionOperator::Lt
        | ConditionOperator::Lte => {
            let Operand::Number(number) = actual else {
                return Err(invalid(condition, "ordering needs a numeric field"));
            };
            let other = as_decimal(expected)
                .ok_or_else(|| invalid(condition, "ordering needs a numeric value"))?;
            Ok(match condition.operator {
                ConditionOperator::Gt => *number > other,
                ConditionOperator::Gte => *number >= other,
                ConditionOperator::Lt => *number < other,
                _ => *number <= other,
            })
        }
        ConditionOperator::Contains | ConditionOperator::NotContains => {
            let needle = as_text(expected)
                .map(|value| normalize_key(&value))
                .ok_or_else(|| invalid(condition, "contains needs a scalar value"))?;
            let found = match actual {
                Operand::Text(text) => normalize_key(text).contains(&needle),
                Operand::List(values) => values
                    .iter()
                    .flat_map(|value| value.split(','))
                    .any(|value| normalize_key(value) == needle),
                Operand::Number(_) => {
                    return Err(invalid(condition, "contains is not defined for a number"));
                }
            };
            Ok(found == (condition.operator == ConditionOperator::Contains))
        }
        ConditionOperator::In | ConditionOperator::NotIn => {
            let Value::Array(options) = expected else {
                return Err(invalid(condition, "membership needs an array value"));
            };
            let found = match actual {
                Operand::Number(number) => {
                    options.iter().filter_map(as_decimal).any(|option| option == *number)
                }
                Operand::Text(text) => options
                    .iter()
                    .filter_map(as_text)
                    .any(|option| normalize_key(&option) == normalize_key(text)),
                Operand::List(_) => {
                    return Err(invalid(condition, "membership is not defined for a list"));
                }
            };
            Ok(found == (condition.operator == ConditionOperator::In))
        }
    }
}

/// Checks that the operator and value shapes are compatible without touching
/// the snapshot.
pub fn check_shape(condition: &Condition) -> Result<(), String> {
    let value = &condition.value;
    if condition.operator.is_membership() {
        return match value {
            Value::Array(_) => Ok(()),
            _ => Err(format!("operator `{}` needs an array value", condition.operator)),
        };
    }
    if condition.operator.is_ordering() && as_decimal(value).is_none() {
        return Err(format!("operator `{}` needs a numeric value", condition.operator));
    }
    if as_text(value).is_none() {
        return Err(format!("operator `{}` needs a scalar value", condition.operator));
    }
    Ok(())
}

pub(crate) fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => {
            let text = number.to_string();
            Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text)).ok()
        }
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn invalid(condition: &Condition, detail: &str) -> ConditionError {
    ConditionError::Invalid {
        target: condition.source.clone(),
        field: condition.field.clone(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{check_shape, evaluate, ConditionError};
    use crate::context::fixtures;
    use crate::context::ContextResolver;
    use crate::domain::rule::{Condition, ConditionOperator};

    fn condition(source: &str, field: &str, operator: ConditionOperator, value: Value) -> Condition {
        Condition { source: source.to_string(), field: field.to_string(), operator, value }
    }

    #[test]
    fn bare_accounts_source_targets_the_paying_account() {
        let snapshot = fixtures::snapshot();
        let resolver = ContextResolver::new(&snapshot);

        let met = condition("accounts", "balance", ConditionOperator::Gte, json!(5000));
        assert!(evaluate(&resolver, &met, "ops-account").expect("evaluate").met);

        let unmet = condition("accounts", "balance", ConditionOperator::Gt, json!(30000));
        let outcome = evaluate(&resolver, &unmet, "payroll").expect("evaluate");
        assert!(!outcome.met);
        assert!(outcome.describe(&unmet).contains("actual 20000"));
    }

    #[test]
    fn treasury_and_named_account_sources() {
        let snapshot = fixtures::snapshot();
        let resolver = ContextResolver::new(&snapshot);

        let treasury = condition("treasury", "available", ConditionOperator::Lt, json!("70000"));
        assert!(evaluate(&resolver, &treasury, "ops-account").expect("evaluate").met);

        let named = condition("accounts.payroll", "currency", ConditionOperator::Eq, json!("usdc"));
        assert!(evaluate(&resolver, &named, "ops-account").expect("evaluate").met);
    }

    #[test]
    fn collection_sources_aggregate() {
        let snapshot = fixtures::snapshot();
        let resolver = ContextResolver::new(&snapshot);

        let count = condition("invoices", "count", ConditionOperator::Eq, json!(1));
        assert!(evaluate(&resolver, &count, "ops-account").expect("evaluate").met);

        let salaries = condition("employees", "salary", ConditionOperator::Lte, json!(9000));
        assert!(evaluate(&resolver, &salaries, "ops-account").expect("evaluate").met);

        let kinds = condition("beneficiaries", "kind", ConditionOperator::Contains, json!("Business"));
        assert!(evaluate(&resolver, &kinds, "ops-account").expect("evaluate").met);

        let tags = condition("contractors", "tags", ConditionOperator::NotContains, json!("sales"));
        assert!(evaluate(&resolver, &tags, "ops-account").expect("evaluate").met);
    }

    #[test]
    fn membership_operators_need_arrays() {
        let snapshot = fixtures::snapshot();
        let resolver = ContextResolver::new(&snapshot);

        let currency = condition("treasury", "currency", ConditionOperator::In, json!(["USDC", "USDT"]));
        assert!(evaluate(&resolver, &currency, "ops-account").expect("evaluate").met);

        let scalar = condition("treasury", "currency", ConditionOperator::NotIn, json!("USDC"));
        assert!(matches!(
            evaluate(&resolver, &scalar, "ops-account"),
            Err(ConditionError::Invalid { .. })
        ));
        assert!(check_shape(&scalar).is_err());
    }

    #[test]
    fn ordering_on_text_is_invalid_and_unknown_fields_fail() {
        let snapshot = fixtures::snapshot();
        let resolver = ContextResolver::new(&snapshot);

        let ordering = condition("treasury", "currency", ConditionOperator::Gt, json!(5));
        assert!(matches!(
            evaluate(&resolver, &ordering, "ops-account"),
            Err(ConditionError::Invalid { .. })
        ));

        let unknown = condition("accounts", "overdraft", ConditionOperator::Gt, json!(5));
        assert!(matches!(
            evaluate(&resolver, &unknown, "ops-account"),
            Err(ConditionError::UnknownReference(_))
        ));
    }
}
