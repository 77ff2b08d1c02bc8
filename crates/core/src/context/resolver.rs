use std::collections::BTreeMap;

use rust_decimal::Decimal;
use thiserror::Error;

use super::{normalize_key, Account, FinancialSnapshot, InvoiceStatus};
use crate::formula::Bindings;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown reference `{reference}`: {detail}")]
pub struct UnknownReferenceError {
    pub reference: String,
    pub detail: String,
}

impl UnknownReferenceError {
    pub(crate) fn new(reference: &str, detail: impl Into<String>) -> Self {
        Self { reference: reference.to_string(), detail: detail.into() }
    }
}

/// One qualifying entry of an expanded collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    /// Identifier of the member itself (beneficiary, invoice or account id).
    pub id: String,
    /// Who gets paid when this member becomes a payment item.
    pub beneficiary_id: String,
    pub fields: Bindings,
    pub text_fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl Member {
    fn literal(id: &str) -> Self {
        Self {
            id: id.to_string(),
            beneficiary_id: id.to_string(),
            fields: Bindings::new(),
            text_fields: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|wanted| {
            let wanted = normalize_key(wanted);
            self.tags.iter().any(|tag| normalize_key(tag) == wanted)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedValue {
    Members(Vec<Member>),
    Number(Decimal),
    Text(String),
    /// Not a collection or field path; returned unchanged.
    Literal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Collection {
    Employees,
    Contractors,
    Individuals,
    Businesses,
    Beneficiaries,
    Invoices,
    Accounts,
}

impl Collection {
    fn parse(name: &str) -> Option<Self> {
        match normalize_key(name).as_str() {
            "employees" | "employee" => Some(Self::Employees),
            "contractors" | "contractor" => Some(Self::Contractors),
            "individuals" | "individual" => Some(Self::Individuals),
            "businesses" | "business" => Some(Self::Businesses),
            "beneficiaries" | "beneficiary" => Some(Self::Beneficiaries),
            "invoices" | "invoice" => Some(Self::Invoices),
            "accounts" | "account" => Some(Self::Accounts),
            _ => None,
        }
    }
}

/// Maps symbolic references in a rule onto snapshot entities and values.
///
/// Collection expansion follows declaration order in the snapshot so that
/// percentage and remainder assignment is reproducible.
pub struct ContextResolver<'a> {
    snapshot: &'a FinancialSnapshot,
}

impl<'a> ContextResolver<'a> {
    pub fn new(snapshot: &'a FinancialSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &'a FinancialSnapshot {
        self.snapshot
    }

    pub fn is_collection(name: &str) -> bool {
        Collection::parse(name).is_some()
    }

    pub fn resolve(&self, reference: &str) -> Result<ResolvedValue, UnknownReferenceError> {
        let trimmed = reference.trim();
        if let Some(collection) = Collection::parse(trimmed) {
            return Ok(ResolvedValue::Members(self.members(collection)));
        }
        if trimmed.contains('.') {
            return self.field(trimmed);
        }
        Ok(ResolvedValue::Literal(trimmed.to_string()))
    }

    /// Expands `reference` into payable members. Collections are filtered by
    /// `tags` (any match); anything else is a literal beneficiary.
    pub fn expand(&self, reference: &str, tags: &[String]) -> Vec<Member> {
        match Collection::parse(reference) {
            Some(collection) => self
                .members(collection)
                .into_iter()
                .filter(|member| tags.is_empty() || member.has_any_tag(tags))
                .collect(),
            None => vec![self.literal_member(reference.trim())],
        }
    }

    pub fn number(&self, path: &str) -> Result<Decimal, UnknownReferenceError> {
        match self.field(path)? {
            ResolvedValue::Number(value) => Ok(value),
            _ => Err(UnknownReferenceError::new(path, "field is not numeric")),
        }
    }

    /// Reads `path` relative to `member` when the path names a collection the
    /// member belongs to (`contractors.rate`), otherwise resolves it globally.
    pub fn number_for_member(
        &self,
        path: &str,
        member: &Member,
    ) -> Result<Decimal, UnknownReferenceError> {
        let segments: Vec<&str> = path.trim().split('.').collect();
        let in_collection = segments.len() == 2
            && Collection::parse(segments[0]).is_some_and(|collection| {
                self.members(collection).iter().any(|candidate| candidate.id == member.id)
            });
        if in_collection {
            let field = segments[1];
            return member.fields.get(field).copied().ok_or_else(|| {
                UnknownReferenceError::new(
                    path,
                    format!("member `{}` has no numeric field `{field}`", member.id),
                )
            });
        }
        if segments.len() == 1 {
            if let Some(value) = member.fields.get(segments[0]) {
                return Ok(*value);
            }
        }
        self.number(path)
    }

    fn field(&self, path: &str) -> Result<ResolvedValue, UnknownReferenceError> {
        let segments: Vec<&str> = path.trim().split('.').map(str::trim).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(UnknownReferenceError::new(path, "empty path segment"));
        }

        match segments.as_slice() {
            ["treasury", field] => self.treasury_field(path, field),
            [head, field] => {
                if let Some(collection) = Collection::parse(head) {
                    return self.aggregate_field(path, collection, field);
                }
                if let Some(account) = self.snapshot.account(head) {
                    return account_field(path, account, field);
                }
                if let Some(member) = self.beneficiary_member(head) {
                    return member_field(path, &member, field);
                }
                Err(UnknownReferenceError::new(path, format!("`{head}` is not in the snapshot")))
            }
            [head, id, field] => {
                let collection = Collection::parse(head).ok_or_else(|| {
                    UnknownReferenceError::new(path, format!("`{head}` is not a collection"))
                })?;
                if collection == Collection::Accounts {
                    let account = self.snapshot.account(id).ok_or_else(|| {
                        UnknownReferenceError::new(path, format!("no account `{id}`"))
                    })?;
                    return account_field(path, account, field);
                }
                let member = self
                    .members(collection)
                    .into_iter()
                    .find(|member| normalize_key(&member.id) == normalize_key(id))
                    .ok_or_else(|| {
                        UnknownReferenceError::new(path, format!("no member `{id}` in `{head}`"))
                    })?;
                member_field(path, &member, field)
            }
            _ => Err(UnknownReferenceError::new(path, "unsupported path depth")),
        }
    }

    fn treasury_field(&self, path: &str, field: &str) -> Result<ResolvedValue, UnknownReferenceError> {
        let treasury = &self.snapshot.treasury;
        match normalize_key(field).as_str() {
            "total_balance" | "balance" | "total" => Ok(ResolvedValue::Number(treasury.total_balance)),
            "reserved" => Ok(ResolvedValue::Number(treasury.reserved)),
            "available" => Ok(ResolvedValue::Number(treasury.available())),
            "currency" => Ok(ResolvedValue::Text(treasury.currency.clone())),
            _ => Err(UnknownReferenceError::new(path, format!("treasury has no field `{field}`"))),
        }
    }

    fn aggregate_field(
        &self,
        path: &str,
        collection: Collection,
        field: &str,
    ) -> Result<ResolvedValue, UnknownReferenceError> {
        let members = self.members(collection);
        if normalize_key(field) == "count" {
            return Ok(ResolvedValue::Number(Decimal::from(members.len())));
        }

        let mut found = members.is_empty();
        let mut total = Decimal::ZERO;
        for member in &members {
            if let Some(value) = member.fields.get(field) {
                found = true;
                total += *value;
            }
        }
        if found {
            Ok(ResolvedValue::Number(total))
        } else {
            Err(UnknownReferenceError::new(path, format!("no member has numeric field `{field}`")))
        }
    }

    pub(crate) fn members_of(&self, name: &str) -> Option<Vec<Member>> {
        Collection::parse(name).map(|collection| self.members(collection))
    }

    fn members(&self, collection: Collection) -> Vec<Member> {
        let snapshot = self.snapshot;
        match collection {
            Collection::Invoices => snapshot
                .invoices
                .iter()
                .filter(|invoice| invoice.status == InvoiceStatus::Pending)
                .map(|invoice| Member {
                    id: invoice.id.clone(),
                    beneficiary_id: invoice.beneficiary_id.clone(),
                    fields: Bindings::from([("amount".to_string(), invoice.amount)]),
                    text_fields: BTreeMap::from([
                        ("id".to_string(), invoice.id.clone()),
                        ("status".to_string(), invoice.status.as_str().to_string()),
                        ("currency".to_string(), invoice.currency.clone()),
                        ("beneficiary".to_string(), invoice.beneficiary_id.clone()),
                    ]),
                    tags: invoice.tags.clone(),
                })
                .collect(),
            Collection::Accounts => snapshot.accounts.iter().map(account_member).collect(),
            _ => snapshot
                .beneficiaries
                .iter()
                .filter(|beneficiary| match collection {
                    Collection::Employees => beneficiary.kind == super::BeneficiaryKind::Employee,
                    Collection::Contractors => {
                        beneficiary.kind == super::BeneficiaryKind::Contractor
                    }
                    Collection::Individuals => {
                        beneficiary.kind == super::BeneficiaryKind::Individual
                    }
                    Collection::Businesses => beneficiary.kind == super::BeneficiaryKind::Business,
                    _ => true,
                })
                .map(beneficiary_member)
                .collect(),
        }
    }

    fn beneficiary_member(&self, id: &str) -> Option<Member> {
        self.snapshot.beneficiary(id).map(beneficiary_member)
    }

    fn literal_member(&self, reference: &str) -> Member {
        // Literal identifiers that match a known beneficiary carry its fields.
        self.beneficiary_member(reference).unwrap_or_else(|| Member::literal(reference))
    }
}

fn beneficiary_member(beneficiary: &super::Beneficiary) -> Member {
    let mut text_fields = BTreeMap::from([
        ("id".to_string(), beneficiary.id.clone()),
        ("name".to_string(), beneficiary.name.clone()),
        ("kind".to_string(), beneficiary.kind.as_str().to_string()),
    ]);
    if let Some(address) = &beneficiary.address {
        text_fields.insert("address".to_string(), address.clone());
    }
    Member {
        id: beneficiary.id.clone(),
        beneficiary_id: beneficiary.id.clone(),
        fields: beneficiary.fields.clone(),
        text_fields,
        tags: beneficiary.tags.clone(),
    }
}

fn account_member(account: &Account) -> Member {
    let mut fields = Bindings::from([("balance".to_string(), account.balance)]);
    if let Some(limit) = account.daily_limit {
        fields.insert("daily_limit".to_string(), limit);
    }
    Member {
        id: account.id.clone(),
        beneficiary_id: account.id.clone(),
        fields,
        text_fields: BTreeMap::from([
            ("id".to_string(), account.id.clone()),
            ("name".to_string(), account.name.clone()),
            ("currency".to_string(), account.currency.clone()),
        ]),
        tags: Vec::new(),
    }
}

fn account_field(
    path: &str,
    account: &Account,
    field: &str,
) -> Result<ResolvedValue, UnknownReferenceError> {
    member_field(path, &account_member(account), field)
}

fn member_field(
    path: &str,
    member: &Member,
    field: &str,
) -> Result<ResolvedValue, UnknownReferenceError> {
    if let Some(value) = member.fields.get(field) {
        return Ok(ResolvedValue::Number(*value));
    }
    if let Some(value) = member.text_fields.get(field) {
        return Ok(ResolvedValue::Text(value.clone()));
    }
    Err(UnknownReferenceError::new(path, format!("`{}` has no field `{field}`", member.id)))
}
