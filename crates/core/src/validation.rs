//! Acceptance checks for a rule before it is stored or scheduled. Rules that
//! fail here never reach resolution.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::context::conditions;
use crate::context::ContextResolver;
use crate::domain::rule::{AmountSpec, ExecutionTiming, PaymentAction, RuleData};
use crate::formula;

/// Returns every problem found, each prefixed with the offending field path.
pub fn validate_rule(rule: &RuleData, now: DateTime<Utc>) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    check_payment(rule, &mut errors);
    check_execution(rule, now, &mut errors);

    for (index, condition) in rule.conditions.iter().enumerate() {
        if condition.source.trim().is_empty() {
            errors.push(format!("conditions[{index}].source: must not be empty"));
        }
        if condition.field.trim().is_empty() {
            errors.push(format!("conditions[{index}].field: must not be empty"));
        }
        if let Err(detail) = conditions::check_shape(condition) {
            errors.push(format!("conditions[{index}].value: {detail}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_payment(rule: &RuleData, errors: &mut Vec<String>) {
    let payment = &rule.payment;
    if payment.source.trim().is_empty() {
        errors.push("payment.source: must not be empty".to_string());
    }
    if payment.currency.trim().is_empty() {
        errors.push("payment.currency: must not be empty".to_string());
    }
    if payment.beneficiary.is_empty() {
        errors.push("payment.beneficiary: at least one beneficiary is required".to_string());
    }
    for (index, beneficiary) in payment.beneficiary.iter().enumerate() {
        if beneficiary.trim().is_empty() {
            errors.push(format!("payment.beneficiary[{index}]: must not be empty"));
        }
    }
    if payment.tags().iter().any(|tag| tag.trim().is_empty()) {
        errors.push("payment.tags: tags must not be empty".to_string());
    }

    match &payment.amount {
        None if payment.action != PaymentAction::Leftover => {
            errors.push(format!("payment.amount: required for `{}`", payment.action.as_str()));
        }
        Some(AmountSpec::Fixed(amount)) if *amount <= Decimal::ZERO => {
            errors.push(format!("payment.amount: must be positive, got {amount}"));
        }
        Some(AmountSpec::Sourced { source, .. }) if source.trim().is_empty() => {
            errors.push("payment.amount.source: must not be empty".to_string());
        }
        _ => {}
    }
    if let Some(expression) = payment.amount.as_ref().and_then(AmountSpec::formula) {
        if let Err(error) = formula::identifiers(expression) {
            errors.push(format!("payment.amount.formula: {error}"));
        }
    }

    let literal_recipients =
        payment.beneficiary.iter().all(|beneficiary| !ContextResolver::is_collection(beneficiary));

    match payment.action {
        PaymentAction::Simple => {
            if payment.beneficiary.len() != 1 || !literal_recipients {
                errors.push(
                    "payment.beneficiary: `simple` pays exactly one literal beneficiary".to_string(),
                );
            }
            if payment.percentages.is_some() {
                errors.push("payment.percentages: not allowed for `simple`".to_string());
            }
        }
        PaymentAction::Split => {
            if payment.percentages.is_none() && literal_recipients {
                errors.push(
                    "payment.percentages: required when splitting between literal beneficiaries"
                        .to_string(),
                );
            }
        }
        PaymentAction::Calculation | PaymentAction::Batch => {
            if payment.action == PaymentAction::Calculation
                && payment.amount.as_ref().and_then(AmountSpec::formula).is_none()
            {
                errors.push("payment.amount.formula: required for `calculation`".to_string());
            }
            for entry in payment.beneficiary.iter().map(|entry| entry.trim()) {
                if !entry.is_empty() && !ContextResolver::is_collection(entry) {
                    errors.push(format!(
                        "payment.beneficiary: `{entry}` is not a collection; `{}` expands collections only",
                        payment.action.as_str()
                    ));
                }
            }
        }
        PaymentAction::Leftover => {}
    }

    if let Some(percentages) = &payment.percentages {
        if !matches!(payment.action, PaymentAction::Split | PaymentAction::Leftover) {
            errors.push(format!(
                "payment.percentages: not allowed for `{}`",
                payment.action.as_str()
            ));
        }
        if percentages.iter().any(|share| share.is_sign_negative()) {
            errors.push("payment.percentages: shares must not be negative".to_string());
        }
        let sum: Decimal = percentages.iter().sum();
        if sum != Decimal::ONE_HUNDRED {
            errors.push(format!("payment.percentages: shares sum to {sum}, expected 100"));
        }
        if literal_recipients && percentages.len() != payment.beneficiary.len() {
            errors.push(format!(
                "payment.percentages: {} shares for {} beneficiaries",
                percentages.len(),
                payment.beneficiary.len()
            ));
        }
    }
}

fn check_execution(rule: &RuleData, now: DateTime<Utc>, errors: &mut Vec<String>) {
    let execution = &rule.execution;
    match execution.timing {
        ExecutionTiming::Once => match execution.at {
            None => errors.push("execution.at: required for `once`".to_string()),
            Some(at) if at <= now.timestamp() => {
                errors.push(format!("execution.at: {at} is not in the future"));
            }
            Some(_) => {}
        },
        ExecutionTiming::Schedule => match execution.cron.as_deref() {
            None => errors.push("execution.cron: required for `schedule`".to_string()),
            Some(expression) => {
                if let Err(detail) = check_cron(expression) {
                    errors.push(format!("execution.cron: {detail}"));
                }
            }
        },
        ExecutionTiming::Hook => {
            let hooks = execution.hooks.as_deref().unwrap_or(&[]);
            if hooks.is_empty() {
                errors.push("execution.hooks: at least one hook is required for `hook`".to_string());
            }
            if hooks.iter().any(|hook| hook.trim().is_empty()) {
                errors.push("execution.hooks: hook names must not be empty".to_string());
            }
        }
    }
}

const CRON_FIELDS: [(&str, u32, u32, &[&str]); 5] = [
    ("minute", 0, 59, &[]),
    ("hour", 0, 23, &[]),
    ("day-of-month", 1, 31, &[]),
    ("month", 1, 12, &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"]),
    ("day-of-week", 0, 7, &["sun", "mon", "tue", "wed", "thu", "fri", "sat"]),
];

/// Five whitespace-separated UNIX cron fields with `*`, lists, ranges, steps
/// and month/weekday names.
pub fn check_cron(expression: &str) -> Result<(), String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != CRON_FIELDS.len() {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }
    for (field, (name, min, max, names)) in fields.iter().zip(CRON_FIELDS) {
        for part in field.split(',') {
            check_cron_part(part, min, max, names)
                .map_err(|detail| format!("{name} field `{field}`: {detail}"))?;
        }
    }
    Ok(())
}

fn check_cron_part(part: &str, min: u32, max: u32, names: &[&str]) -> Result<(), String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    if let Some(step) = step {
        match step.parse::<u32>() {
            Ok(step) if step > 0 && step <= max => {}
            _ => return Err(format!("invalid step `{step}`")),
        }
    }
    if range == "*" {
        return Ok(());
    }

    let value = |token: &str| -> Result<u32, String> {
        let parsed = match token.parse::<u32>() {
            Ok(number) => Some(number),
            Err(_) => names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(token))
                .and_then(|index| u32::try_from(index).ok())
                .map(|index| index + min),
        };
        match parsed {
            Some(number) if (min..=max).contains(&number) => Ok(number),
            _ => Err(format!("`{token}` is outside {min}-{max}")),
        }
    };

    match range.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (value(start)?, value(end)?);
            if start > end {
                return Err(format!("range {start}-{end} is reversed"));
            }
            Ok(())
        }
        None => value(range).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{check_cron, validate_rule};
    use crate::domain::rule::RuleData;

    fn rule(value: serde_json::Value) -> RuleData {
        serde_json::from_value(value).expect("rule")
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("timestamp")
    }

    #[test]
    fn well_formed_rules_pass() {
        let scheduled = rule(json!({
            "payment": {
                "action": "batch",
                "source": "payroll",
                "amount": { "source": "employees.salary" },
                "currency": "USDC",
                "beneficiary": "employees",
                "tags": ["engineering"]
            },
            "execution": { "timing": "schedule", "cron": "0 9 1 * MON-FRI" },
            "conditions": [
                { "source": "treasury", "field": "balance", "operator": ">", "value": 10000 }
            ]
        }));
        assert_eq!(validate_rule(&scheduled, now()), Ok(()));

        let once = rule(json!({
            "payment": {
                "action": "split",
                "source": "ops-account",
                "amount": 900,
                "currency": "USDC",
                "beneficiary": ["wallet-A", "wallet-B"],
                "percentages": [60, 40]
            },
            "execution": { "timing": "once", "at": now().timestamp() + 3600 }
        }));
        assert_eq!(validate_rule(&once, now()), Ok(()));
    }

    #[test]
    fn errors_are_field_qualified_and_collected() {
        let broken = rule(json!({
            "payment": {
                "action": "split",
                "source": "ops-account",
                "amount": 100,
                "currency": "USDC",
                "beneficiary": ["A", "B", "C"],
                "percentages": [50, 30, 21]
            },
            "execution": { "timing": "once", "at": now().timestamp() - 60 },
            "conditions": [
                { "source": "accounts", "field": "balance", "operator": "in", "value": 5 }
            ]
        }));

        let errors = validate_rule(&broken, now()).expect_err("invalid");
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors[0].starts_with("payment.percentages: shares sum to 101"));
        assert!(errors[1].starts_with("execution.at:"));
        assert!(errors[2].starts_with("conditions[0].value:"));
    }

    #[test]
    fn action_specific_shapes_are_enforced() {
        let calculation = rule(json!({
            "payment": {
                "action": "calculation",
                "source": "ops-account",
                "amount": { "source": "contractors.hours" },
                "currency": "USDC",
                "beneficiary": ["contractors"]
            },
            "execution": { "timing": "hook", "hooks": [] }
        }));
        let errors = validate_rule(&calculation, now()).expect_err("invalid");
        assert!(errors.contains(&"payment.amount.formula: required for `calculation`".to_string()));
        assert!(errors.iter().any(|error| error.starts_with("execution.hooks:")));

        let simple = rule(json!({
            "payment": {
                "action": "simple",
                "source": "ops-account",
                "amount": 10,
                "currency": "USDC",
                "beneficiary": ["employees"]
            },
            "execution": { "timing": "schedule" }
        }));
        let errors = validate_rule(&simple, now()).expect_err("invalid");
        assert!(errors[0].starts_with("payment.beneficiary:"));
        assert_eq!(errors[1], "execution.cron: required for `schedule`");
    }

    #[test]
    fn batch_and_calculation_reject_literal_beneficiaries() {
        for action in ["batch", "calculation"] {
            let literal = rule(json!({
                "payment": {
                    "action": action,
                    "source": "payroll",
                    "amount": { "source": "employees.salary", "formula": "salary * 0.1" },
                    "currency": "USDC",
                    "beneficiary": ["employees", "vendors"]
                },
                "execution": { "timing": "once", "at": now().timestamp() + 3600 }
            }));

            let errors = validate_rule(&literal, now()).expect_err("literal beneficiary");
            assert_eq!(errors.len(), 1, "{action}: {errors:?}");
            assert!(errors[0].starts_with("payment.beneficiary: `vendors` is not a collection"));
        }
    }

    #[test]
    fn cron_syntax() {
        assert!(check_cron("*/15 0-6 * jan-mar 0,6").is_ok());
        assert!(check_cron("0 9 * * 7").is_ok());
        assert!(check_cron("0 9 * *").is_err());
        assert!(check_cron("61 * * * *").is_err());
        assert!(check_cron("0 9 * * 5-1").is_err());
        assert!(check_cron("*/0 * * * *").is_err());
    }
}
