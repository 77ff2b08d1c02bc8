//! Read-only view of the financial dataset that every pipeline stage resolves
//! against.

pub mod conditions;
pub mod dataset;
pub mod resolver;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dataset::InMemoryFinancialDataset;
pub use resolver::{ContextResolver, Member, ResolvedValue, UnknownReferenceError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("financial context unavailable: {0}")]
    Unavailable(String),
    #[error("financial dataset is invalid: {0}")]
    InvalidDataset(String),
}

/// Supplies the current snapshot. Implementations must return a consistent
/// point-in-time copy; stages never observe partial updates.
pub trait ContextProvider: Send + Sync {
    fn snapshot(&self) -> Result<FinancialSnapshot, ContextError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub currency: String,
    pub balance: Decimal,
    #[serde(default)]
    pub daily_limit: Option<Decimal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeneficiaryKind {
    Employee,
    Contractor,
    Individual,
    Business,
}

impl BeneficiaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Contractor => "contractor",
            Self::Individual => "individual",
            Self::Business => "business",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: BeneficiaryKind,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Numeric attributes such as `salary`, `rate` or `hours`.
    #[serde(default)]
    pub fields: BTreeMap<String, Decimal>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub beneficiary_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: InvoiceStatus,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treasury {
    pub currency: String,
    pub total_balance: Decimal,
    pub reserved: Decimal,
}

impl Treasury {
    pub fn available(&self) -> Decimal {
        self.total_balance - self.reserved
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub account_id: String,
    pub beneficiary_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub accounts: Vec<Account>,
    pub beneficiaries: Vec<Beneficiary>,
    pub invoices: Vec<Invoice>,
    pub treasury: Treasury,
    pub transfers: Vec<TransferRecord>,
    pub captured_at: DateTime<Utc>,
}

impl FinancialSnapshot {
    pub fn account(&self, id: &str) -> Option<&Account> {
        let key = normalize_key(id);
        self.accounts.iter().find(|account| normalize_key(&account.id) == key)
    }

    /// Looks a beneficiary up by id first, then by address.
    pub fn beneficiary(&self, id_or_address: &str) -> Option<&Beneficiary> {
        let key = normalize_key(id_or_address);
        self.beneficiaries
            .iter()
            .find(|beneficiary| normalize_key(&beneficiary.id) == key)
            .or_else(|| {
                self.beneficiaries.iter().find(|beneficiary| {
                    beneficiary.address.as_deref().map(normalize_key).as_deref()
                        == Some(key.as_str())
                })
            })
    }

    /// Successful outgoing transfers from `account_id` at or after `since`.
    pub fn transfers_since<'a>(
        &'a self,
        account_id: &'a str,
        since: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a TransferRecord> + 'a {
        let key = normalize_key(account_id);
        self.transfers.iter().filter(move |transfer| {
            transfer.executed_at >= since && normalize_key(&transfer.account_id) == key
        })
    }

    pub fn spend_since(&self, account_id: &str, since: DateTime<Utc>) -> Decimal {
        self.transfers_since(account_id, since).map(|transfer| transfer.amount).sum()
    }
}

pub(crate) fn normalize_key(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
