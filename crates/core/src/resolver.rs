//! Expands one rule into atomic payment items.
//!
//! Resolution never fails past this boundary: every problem becomes a coded
//! issue on the returned [`ResolutionResult`]. Guard conditions are checked
//! before any amount is computed; an unmet condition is a no-op outcome and is
//! reported separately from errors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::conditions::{self, ConditionError};
use crate::context::{
    normalize_key, ContextError, ContextProvider, ContextResolver, FinancialSnapshot, Member,
    UnknownReferenceError,
};
use crate::domain::payment::{
    round_to_minor_unit, total_amount, truncate_to_minor_unit, PaymentItem,
};
use crate::domain::rule::{AmountSpec, PaymentAction, RuleData};
use crate::formula::{self, Bindings, FormulaError};

/// Stable machine codes carried by resolution issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueCode {
    UnknownReferenceError,
    FormulaError,
    SplitPercentageError,
    ConditionNotMetError,
    InvalidRuleError,
    InvalidAmountError,
    EmptyBatchError,
    ContextUnavailableError,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownReferenceError => "UnknownReferenceError",
            Self::FormulaError => "FormulaError",
            Self::SplitPercentageError => "SplitPercentageError",
            Self::ConditionNotMetError => "ConditionNotMetError",
            Self::InvalidRuleError => "InvalidRuleError",
            Self::InvalidAmountError => "InvalidAmountError",
            Self::EmptyBatchError => "EmptyBatchError",
            Self::ContextUnavailableError => "ContextUnavailableError",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionIssue {
    pub code: IssueCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub success: bool,
    pub payment_items: Vec<PaymentItem>,
    pub total_amount: Decimal,
    pub errors: Vec<ResolutionIssue>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmet_conditions: Vec<ResolutionIssue>,
}

impl ResolutionResult {
    fn failure(error: ResolutionError, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            payment_items: Vec::new(),
            total_amount: Decimal::ZERO,
            errors: vec![error.into_issue()],
            warnings,
            unmet_conditions: Vec::new(),
        }
    }

    fn not_met(unmet_conditions: Vec<ResolutionIssue>, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            payment_items: Vec::new(),
            total_amount: Decimal::ZERO,
            errors: Vec::new(),
            warnings,
            unmet_conditions,
        }
    }

    /// Resolvable rule whose guard conditions were false.
    pub fn condition_not_met(&self) -> bool {
        self.success && !self.unmet_conditions.is_empty()
    }

    pub fn has_error(&self, code: IssueCode) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    UnknownReference(#[from] UnknownReferenceError),
    #[error("formula `{expression}` failed: {source}")]
    Formula {
        expression: String,
        #[source]
        source: FormulaError,
    },
    #[error("{0}")]
    SplitPercentage(String),
    #[error("{0}")]
    InvalidRule(String),
    #[error("{0}")]
    InvalidAmount(String),
    #[error("{0}")]
    EmptyBatch(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl ResolutionError {
    pub fn code(&self) -> IssueCode {
        match self {
            Self::UnknownReference(_) => IssueCode::UnknownReferenceError,
            Self::Formula { .. } => IssueCode::FormulaError,
            Self::SplitPercentage(_) => IssueCode::SplitPercentageError,
            Self::InvalidRule(_) => IssueCode::InvalidRuleError,
            Self::InvalidAmount(_) => IssueCode::InvalidAmountError,
            Self::EmptyBatch(_) => IssueCode::EmptyBatchError,
            Self::Context(_) => IssueCode::ContextUnavailableError,
        }
    }

    pub fn into_issue(self) -> ResolutionIssue {
        ResolutionIssue { code: self.code(), message: self.to_string() }
    }
}

impl From<ConditionError> for ResolutionError {
    fn from(error: ConditionError) -> Self {
        match error {
            ConditionError::UnknownReference(error) => Self::UnknownReference(error),
            invalid @ ConditionError::Invalid { .. } => Self::InvalidRule(invalid.to_string()),
        }
    }
}

/// Amounts already committed per source account within one execution.
#[derive(Debug, Default)]
struct Session {
    obligations: BTreeMap<String, Decimal>,
}

impl Session {
    fn committed(&self, account: &str) -> Decimal {
        self.obligations.get(&normalize_key(account)).copied().unwrap_or(Decimal::ZERO)
    }

    fn commit(&mut self, account: &str, amount: Decimal) {
        *self.obligations.entry(normalize_key(account)).or_insert(Decimal::ZERO) += amount;
    }
}

struct Draft {
    beneficiary_id: String,
    amount: Decimal,
    reference: Option<String>,
}

impl Draft {
    fn from_member(member: &Member, amount: Decimal) -> Self {
        Self {
            beneficiary_id: member.beneficiary_id.clone(),
            amount,
            reference: (member.id != member.beneficiary_id).then(|| member.id.clone()),
        }
    }
}

#[derive(Clone)]
pub struct PaymentResolver {
    provider: Arc<dyn ContextProvider>,
}

impl PaymentResolver {
    pub fn new(provider: Arc<dyn ContextProvider>) -> Self {
        Self { provider }
    }

    pub fn resolve_payments(&self, rule: &RuleData) -> ResolutionResult {
        match self.provider.snapshot() {
            Ok(snapshot) => resolve_against(&snapshot, rule),
            Err(error) => ResolutionResult::failure(error.into(), Vec::new()),
        }
    }

    /// Resolves several rules as one execution against a single snapshot.
    /// Leftover rules are resolved after every other rule so they see the
    /// obligations already placed on their source account. Results keep the
    /// input order.
    pub fn resolve_many(&self, rules: &[RuleData]) -> Vec<ResolutionResult> {
        let snapshot = match self.provider.snapshot() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                let issue = ResolutionError::from(error).into_issue();
                return rules
                    .iter()
                    .map(|_| ResolutionResult {
                        success: false,
                        payment_items: Vec::new(),
                        total_amount: Decimal::ZERO,
                        errors: vec![issue.clone()],
                        warnings: Vec::new(),
                        unmet_conditions: Vec::new(),
                    })
                    .collect();
            }
        };

        let resolver = ContextResolver::new(&snapshot);
        let mut session = Session::default();
        let mut results: Vec<Option<ResolutionResult>> = vec![None; rules.len()];
        let ordered = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.payment.action != PaymentAction::Leftover)
            .chain(
                rules
                    .iter()
                    .enumerate()
                    .filter(|(_, rule)| rule.payment.action == PaymentAction::Leftover),
            );
        for (index, rule) in ordered {
            results[index] = Some(resolve_in_session(&resolver, rule, &mut session));
        }
        results.into_iter().flatten().collect()
    }
}

/// Resolves `rule` against an explicit snapshot.
pub fn resolve_against(snapshot: &FinancialSnapshot, rule: &RuleData) -> ResolutionResult {
    let resolver = ContextResolver::new(snapshot);
    resolve_in_session(&resolver, rule, &mut Session::default())
}

fn resolve_in_session(
    resolver: &ContextResolver<'_>,
    rule: &RuleData,
    session: &mut Session,
) -> ResolutionResult {
    let mut warnings = Vec::new();
    let payment = &rule.payment;

    if let Err(error) = check_percentages(resolver, rule) {
        return ResolutionResult::failure(error, warnings);
    }

    let mut unmet = Vec::new();
    for condition in &rule.conditions {
        match conditions::evaluate(resolver, condition, &payment.source) {
            Ok(outcome) if outcome.met => {}
            Ok(outcome) => unmet.push(ResolutionIssue {
                code: IssueCode::ConditionNotMetError,
                message: outcome.describe(condition),
            }),
            Err(error) => return ResolutionResult::failure(error.into(), warnings),
        }
    }
    if !unmet.is_empty() {
        debug!(
            event_name = "pipeline.resolution.condition_not_met",
            action = payment.action.as_str(),
            unmet = unmet.len(),
            "rule conditions not met"
        );
        return ResolutionResult::not_met(unmet, warnings);
    }

    let drafts = match payment.action {
        PaymentAction::Simple => resolve_simple(resolver, rule),
        PaymentAction::Split => resolve_split(resolver, rule),
        PaymentAction::Batch => resolve_batch(resolver, rule, false),
        PaymentAction::Calculation => resolve_batch(resolver, rule, true),
        PaymentAction::Leftover => resolve_leftover(resolver, rule, session, &mut warnings),
    };
    let drafts = match drafts {
        Ok(drafts) => drafts,
        Err(error) => return ResolutionResult::failure(error, warnings),
    };

    match finish(rule, drafts, &mut warnings) {
        Ok(payment_items) => {
            let total = total_amount(&payment_items);
            session.commit(&payment.source, total);
            debug!(
                event_name = "pipeline.resolution.resolved",
                action = payment.action.as_str(),
                items = payment_items.len(),
                total = %total,
                "rule resolved"
            );
            ResolutionResult {
                success: true,
                payment_items,
                total_amount: total,
                errors: Vec::new(),
                warnings,
                unmet_conditions: Vec::new(),
            }
        }
        Err(error) => ResolutionResult::failure(error, warnings),
    }
}

fn finish(
    rule: &RuleData,
    drafts: Vec<Draft>,
    warnings: &mut Vec<String>,
) -> Result<Vec<PaymentItem>, ResolutionError> {
    let payment = &rule.payment;
    let mut items = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let amount = round_to_minor_unit(draft.amount, &payment.currency);
        if amount < Decimal::ZERO {
            return Err(ResolutionError::InvalidAmount(format!(
                "amount for `{}` resolved to {amount}, amounts must not be negative",
                draft.beneficiary_id
            )));
        }
        if amount.is_zero() {
            warnings.push(format!("skipped `{}`: amount resolved to zero", draft.beneficiary_id));
            continue;
        }
        items.push(PaymentItem {
            sequence: u32::try_from(items.len() + 1).unwrap_or(u32::MAX),
            beneficiary_id: draft.beneficiary_id,
            amount,
            currency: payment.currency.trim().to_string(),
            source_account: payment.source.trim().to_string(),
            reference: draft.reference,
        });
    }

    if items.is_empty() {
        return Err(ResolutionError::EmptyBatch(format!(
            "{} payment resolved to no payable items",
            payment.action.as_str()
        )));
    }
    Ok(items)
}

fn check_percentages(resolver: &ContextResolver<'_>, rule: &RuleData) -> Result<(), ResolutionError> {
    let payment = &rule.payment;
    if !matches!(payment.action, PaymentAction::Split | PaymentAction::Leftover) {
        return Ok(());
    }
    let Some(percentages) = &payment.percentages else {
        return Ok(());
    };

    if percentages.iter().any(|pct| *pct < Decimal::ZERO) {
        return Err(ResolutionError::SplitPercentage(
            "split percentages must not be negative".to_string(),
        ));
    }
    let sum: Decimal = percentages.iter().sum();
    if sum != Decimal::ONE_HUNDRED {
        return Err(ResolutionError::SplitPercentage(format!(
            "split percentages sum to {}, expected 100",
            sum.normalize()
        )));
    }

    let recipients = recipients(resolver, rule).len();
    if recipients != percentages.len() {
        return Err(ResolutionError::SplitPercentage(format!(
            "{} percentages given for {recipients} beneficiaries",
            percentages.len()
        )));
    }
    Ok(())
}

/// Beneficiary entries expanded in declaration order. Tag filtering applies to
/// collection entries only.
fn recipients(resolver: &ContextResolver<'_>, rule: &RuleData) -> Vec<Member> {
    let tags = rule.payment.tags();
    rule.payment
        .beneficiary
        .iter()
        .filter(|entry| !entry.trim().is_empty())
        .flat_map(|entry| resolver.expand(entry, tags))
        .collect()
}

fn resolve_simple(
    resolver: &ContextResolver<'_>,
    rule: &RuleData,
) -> Result<Vec<Draft>, ResolutionError> {
    let payment = &rule.payment;
    let [beneficiary] = payment.beneficiary.as_slice() else {
        return Err(ResolutionError::InvalidRule(format!(
            "simple payment needs exactly one beneficiary, got {}",
            payment.beneficiary.len()
        )));
    };
    if ContextResolver::is_collection(beneficiary) {
        return Err(ResolutionError::InvalidRule(format!(
            "simple payment cannot target collection `{beneficiary}`, use batch"
        )));
    }

    let member = resolver.expand(beneficiary, &[]).into_iter().next();
    let known = resolver.snapshot().beneficiary(beneficiary).is_some();
    let amount = amount_for(resolver, rule, member.as_ref().filter(|_| known))?;
    let member = member.ok_or_else(|| {
        ResolutionError::InvalidRule("simple payment beneficiary is empty".to_string())
    })?;
    Ok(vec![Draft::from_member(&member, amount)])
}

fn resolve_split(
    resolver: &ContextResolver<'_>,
    rule: &RuleData,
) -> Result<Vec<Draft>, ResolutionError> {
    let members = recipients(resolver, rule);
    if members.is_empty() {
        return Err(ResolutionError::EmptyBatch("split has no beneficiaries".to_string()));
    }
    let total = amount_for(resolver, rule, None)?;
    distribute(&members, total, rule)
}

fn resolve_batch(
    resolver: &ContextResolver<'_>,
    rule: &RuleData,
    formula_required: bool,
) -> Result<Vec<Draft>, ResolutionError> {
    if formula_required && rule.payment.amount.as_ref().and_then(AmountSpec::formula).is_none() {
        return Err(ResolutionError::InvalidRule(
            "calculation payment requires amount.formula".to_string(),
        ));
    }
    // Only collections expand here; a literal would be paid as an ad-hoc member.
    if let Some(entry) = rule
        .payment
        .beneficiary
        .iter()
        .find(|entry| !entry.trim().is_empty() && !ContextResolver::is_collection(entry))
    {
        return Err(UnknownReferenceError::new(
            entry.trim(),
            format!("`{}` beneficiaries must name a collection", rule.payment.action.as_str()),
        )
        .into());
    }

    recipients(resolver, rule)
        .iter()
        .map(|member| {
            amount_for(resolver, rule, Some(member)).map(|amount| Draft::from_member(member, amount))
        })
        .collect()
}

fn resolve_leftover(
    resolver: &ContextResolver<'_>,
    rule: &RuleData,
    session: &Session,
    warnings: &mut Vec<String>,
) -> Result<Vec<Draft>, ResolutionError> {
    let payment = &rule.payment;
    let account = resolver.snapshot().account(&payment.source).ok_or_else(|| {
        UnknownReferenceError {
            reference: payment.source.clone(),
            detail: "source account is not in the snapshot".to_string(),
        }
    })?;
    if payment.amount.is_some() {
        warnings.push("payment.amount is ignored for leftover payments".to_string());
    }

    let committed = session.committed(&payment.source);
    let remaining = account.balance - committed;
    if remaining <= Decimal::ZERO {
        return Err(ResolutionError::EmptyBatch(format!(
            "nothing left in `{}`: balance {} with {} already committed",
            account.id, account.balance, committed
        )));
    }

    let members = recipients(resolver, rule);
    if members.is_empty() {
        return Err(ResolutionError::EmptyBatch("leftover has no beneficiaries".to_string()));
    }
    distribute(&members, remaining, rule)
}

/// Splits `total` over `members` by percentage or equally. Each share is
/// truncated to the minor unit and the remainder goes to the first member, so
/// the shares always add up to `total` exactly.
fn distribute(members: &[Member], total: Decimal, rule: &RuleData) -> Result<Vec<Draft>, ResolutionError> {
    let currency = &rule.payment.currency;
    let total = round_to_minor_unit(total, currency);
    let overflow = || ResolutionError::InvalidAmount(format!("cannot split {total}"));

    let mut shares = match &rule.payment.percentages {
        Some(percentages) => percentages
            .iter()
            .map(|pct| {
                total
                    .checked_mul(*pct)
                    .and_then(|value| value.checked_div(Decimal::ONE_HUNDRED))
                    .map(|value| truncate_to_minor_unit(value, currency))
                    .ok_or_else(overflow)
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => {
            let share = total
                .checked_div(Decimal::from(members.len()))
                .map(|value| truncate_to_minor_unit(value, currency))
                .ok_or_else(overflow)?;
            vec![share; members.len()]
        }
    };

    let assigned: Decimal = shares.iter().sum();
    if let Some(first) = shares.first_mut() {
        *first += total - assigned;
    }

    Ok(members.iter().zip(shares).map(|(member, share)| Draft::from_member(member, share)).collect())
}

/// Computes the amount for one item. `member` is the collection member the
/// item is expanded from; member-relative paths read its fields.
fn amount_for(
    resolver: &ContextResolver<'_>,
    rule: &RuleData,
    member: Option<&Member>,
) -> Result<Decimal, ResolutionError> {
    let amount_spec = rule.payment.amount.as_ref().ok_or_else(|| {
        ResolutionError::InvalidRule(format!(
            "{} payment requires payment.amount",
            rule.payment.action.as_str()
        ))
    })?;

    let (source, expression) = match amount_spec {
        AmountSpec::Fixed(value) => return Ok(*value),
        AmountSpec::Sourced { source, formula } => (source.as_str(), formula.as_deref()),
    };

    let lookup = |path: &str| match member {
        Some(member) => resolver.number_for_member(path, member),
        None => resolver.number(path),
    };

    let source_value = if ContextResolver::is_collection(source) {
        None
    } else {
        Some(lookup(source)?)
    };

    let Some(expression) = expression else {
        return source_value.ok_or_else(|| {
            ResolutionError::InvalidRule(format!(
                "amount source `{source}` is a collection, a formula is required"
            ))
        });
    };

    let mut bindings = Bindings::new();
    if let Some(member) = member {
        bindings.extend(member.fields.iter().map(|(name, value)| (name.clone(), *value)));
    }
    if let Some(value) = source_value {
        bindings.insert(source.to_string(), value);
        if let Some(field) = source.rsplit('.').next() {
            bindings.insert(field.to_string(), value);
        }
    }

    let formula_error = |source: FormulaError| ResolutionError::Formula {
        expression: expression.to_string(),
        source,
    };
    for name in formula::identifiers(expression).map_err(formula_error)? {
        if !bindings.contains_key(&name) {
            bindings.insert(name.clone(), lookup(&name)?);
        }
    }
    formula::evaluate(expression, &bindings).map_err(formula_error)
}
