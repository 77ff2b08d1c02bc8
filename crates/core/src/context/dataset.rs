use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    normalize_key, Account, Beneficiary, BeneficiaryKind, ContextError, ContextProvider,
    FinancialSnapshot, Invoice, InvoiceStatus, TransferRecord, Treasury,
};
use crate::domain::execution::ChatId;
use crate::domain::payment::PaymentItem;
use crate::processor::{PaymentExecutor, TransferError, TransferReceipt};

/// On-disk shape of a dataset fixture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFile {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub beneficiaries: Vec<Beneficiary>,
    #[serde(default)]
    pub invoices: Vec<Invoice>,
    pub treasury: Treasury,
    #[serde(default)]
    pub transfers: Vec<TransferRecord>,
}

/// Process-local financial dataset. Snapshots are cloned under a read lock so
/// every stage sees a consistent copy; executed transfers debit the account
/// and are appended to the transfer history.
pub struct InMemoryFinancialDataset {
    state: RwLock<DatasetFile>,
}

impl InMemoryFinancialDataset {
    pub fn new(dataset: DatasetFile) -> Result<Self, ContextError> {
        validate(&dataset)?;
        Ok(Self { state: RwLock::new(dataset) })
    }

    pub fn from_json(raw: &str) -> Result<Self, ContextError> {
        let dataset: DatasetFile = serde_json::from_str(raw)
            .map_err(|error| ContextError::InvalidDataset(error.to_string()))?;
        Self::new(dataset)
    }

    pub fn from_path(path: &Path) -> Result<Self, ContextError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ContextError::Unavailable(format!("cannot read dataset {}: {error}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Loads `path` when given, otherwise the built-in demo dataset.
    pub fn load(path: Option<&Path>) -> Result<Self, ContextError> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::demo()),
        }
    }

    pub fn demo() -> Self {
        Self { state: RwLock::new(demo_dataset()) }
    }

    fn read(&self) -> RwLockReadGuard<'_, DatasetFile> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, DatasetFile> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn balance(&self, account_id: &str) -> Option<Decimal> {
        let key = normalize_key(account_id);
        self.read()
            .accounts
            .iter()
            .find(|account| normalize_key(&account.id) == key)
            .map(|account| account.balance)
    }

    pub fn transfer_count(&self) -> usize {
        self.read().transfers.len()
    }
}

impl ContextProvider for InMemoryFinancialDataset {
    fn snapshot(&self) -> Result<FinancialSnapshot, ContextError> {
        let state = self.read();
        Ok(FinancialSnapshot {
            accounts: state.accounts.clone(),
            beneficiaries: state.beneficiaries.clone(),
            invoices: state.invoices.clone(),
            treasury: state.treasury.clone(),
            transfers: state.transfers.clone(),
            captured_at: Utc::now(),
        })
    }
}

#[async_trait]
impl PaymentExecutor for InMemoryFinancialDataset {
    async fn execute(
        &self,
        chat_id: &ChatId,
        item: &PaymentItem,
    ) -> Result<TransferReceipt, TransferError> {
        if item.amount <= Decimal::ZERO {
            return Err(TransferError::Rejected(format!(
                "amount {} is not positive",
                item.amount
            )));
        }

        let mut state = self.write();
        let key = normalize_key(&item.source_account);
        let account = state
            .accounts
            .iter_mut()
            .find(|account| normalize_key(&account.id) == key)
            .ok_or_else(|| TransferError::UnknownAccount(item.source_account.clone()))?;

        if !account.currency.eq_ignore_ascii_case(&item.currency) {
            return Err(TransferError::CurrencyMismatch {
                account: account.id.clone(),
                expected: account.currency.clone(),
                actual: item.currency.clone(),
            });
        }
        if account.balance < item.amount {
            return Err(TransferError::InsufficientFunds {
                account: account.id.clone(),
                requested: item.amount,
                available: account.balance,
            });
        }

        account.balance -= item.amount;
        let account_id = account.id.clone();
        if state.treasury.currency.eq_ignore_ascii_case(&item.currency) {
            state.treasury.total_balance -= item.amount;
        }

        let executed_at = Utc::now();
        let transfer_id = format!("tx-{}", Uuid::new_v4());
        state.transfers.push(TransferRecord {
            transfer_id: transfer_id.clone(),
            account_id,
            beneficiary_id: item.beneficiary_id.clone(),
            amount: item.amount,
            currency: item.currency.clone(),
            executed_at,
            chat_id: Some(chat_id.0.clone()),
        });
        if let Some(reference) = &item.reference {
            // Paying an invoice settles it.
            if let Some(invoice) = state.invoices.iter_mut().find(|invoice| &invoice.id == reference) {
                invoice.status = InvoiceStatus::Paid;
            }
        }

        Ok(TransferReceipt { transfer_id, executed_at })
    }
}

fn validate(dataset: &DatasetFile) -> Result<(), ContextError> {
    let mut seen = BTreeSet::new();
    for account in &dataset.accounts {
        if account.id.trim().is_empty() {
            return Err(ContextError::InvalidDataset("account id must not be empty".to_string()));
        }
        if !seen.insert(normalize_key(&account.id)) {
            return Err(ContextError::InvalidDataset(format!(
                "duplicate account `{}`",
                account.id
            )));
        }
        if account.balance < Decimal::ZERO {
            return Err(ContextError::InvalidDataset(format!(
                "account `{}` has a negative balance",
                account.id
            )));
        }
    }

    let mut seen = BTreeSet::new();
    for beneficiary in &dataset.beneficiaries {
        if !seen.insert(normalize_key(&beneficiary.id)) {
            return Err(ContextError::InvalidDataset(format!(
                "duplicate beneficiary `{}`",
                beneficiary.id
            )));
        }
    }

    for invoice in &dataset.invoices {
        if invoice.amount < Decimal::ZERO {
            return Err(ContextError::InvalidDataset(format!(
                "invoice `{}` has a negative amount",
                invoice.id
            )));
        }
    }
    Ok(())
}

fn demo_person(
    id: &str,
    name: &str,
    kind: BeneficiaryKind,
    tags: &[&str],
    fields: &[(&str, i64)],
) -> Beneficiary {
    Beneficiary {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        address: Some(format!("0x{:0>40}", id.replace('-', ""))),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        fields: fields
            .iter()
            .map(|(field, value)| (field.to_string(), Decimal::new(*value, 0)))
            .collect(),
        active: true,
    }
}

fn demo_dataset() -> DatasetFile {
    let usdc = || "USDC".to_string();

    DatasetFile {
        accounts: vec![
            Account {
                id: "ops-account".to_string(),
                name: "Operations".to_string(),
                currency: usdc(),
                balance: Decimal::new(250_000, 0),
                daily_limit: Some(Decimal::new(100_000, 0)),
            },
            Account {
                id: "payroll".to_string(),
                name: "Payroll".to_string(),
                currency: usdc(),
                balance: Decimal::new(80_000, 0),
                daily_limit: None,
            },
            Account {
                id: "reserve".to_string(),
                name: "Reserve".to_string(),
                currency: usdc(),
                balance: Decimal::new(500_000, 0),
                daily_limit: Some(Decimal::new(25_000, 0)),
            },
        ],
        beneficiaries: vec![
            demo_person("emp-alice", "Alice Chen", BeneficiaryKind::Employee, &["engineering"], &[("salary", 8_500)]),
            demo_person("emp-bob", "Bob Okafor", BeneficiaryKind::Employee, &["sales"], &[("salary", 6_200)]),
            demo_person("emp-carol", "Carol Diaz", BeneficiaryKind::Employee, &["engineering", "lead"], &[("salary", 9_800)]),
            demo_person(
                "ctr-dev",
                "Dev Patel",
                BeneficiaryKind::Contractor,
                &["engineering", "remote"],
                &[("rate", 95), ("hours", 120)],
            ),
            demo_person(
                "ctr-eve",
                "Eve Martin",
                BeneficiaryKind::Contractor,
                &["design"],
                &[("rate", 80), ("hours", 60)],
            ),
            demo_person("ind-frank", "Frank Li", BeneficiaryKind::Individual, &["referral"], &[]),
            demo_person("biz-cloudhost", "CloudHost Inc", BeneficiaryKind::Business, &["vendor", "infrastructure"], &[]),
            demo_person("biz-legal", "Legal Partners LLP", BeneficiaryKind::Business, &["vendor"], &[]),
        ],
        invoices: vec![
            Invoice {
                id: "INV-1001".to_string(),
                beneficiary_id: "biz-cloudhost".to_string(),
                amount: Decimal::new(4_250_00, 2),
                currency: usdc(),
                status: InvoiceStatus::Pending,
                tags: vec!["infrastructure".to_string()],
            },
            Invoice {
                id: "INV-1002".to_string(),
                beneficiary_id: "biz-legal".to_string(),
                amount: Decimal::new(1_800_00, 2),
                currency: usdc(),
                status: InvoiceStatus::Pending,
                tags: vec!["legal".to_string()],
            },
            Invoice {
                id: "INV-0999".to_string(),
                beneficiary_id: "biz-legal".to_string(),
                amount: Decimal::new(2_000_00, 2),
                currency: usdc(),
                status: InvoiceStatus::Paid,
                tags: vec!["legal".to_string()],
            },
        ],
        treasury: Treasury {
            currency: usdc(),
            total_balance: Decimal::new(830_000, 0),
            reserved: Decimal::new(100_000, 0),
        },
        transfers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::InMemoryFinancialDataset;
    use crate::context::{ContextError, ContextProvider};
    use crate::domain::execution::ChatId;
    use crate::domain::payment::PaymentItem;
    use crate::processor::{PaymentExecutor, TransferError};

    fn item(source: &str, amount: i64, reference: Option<&str>) -> PaymentItem {
        PaymentItem {
            sequence: 1,
            beneficiary_id: "wallet-A".to_string(),
            amount: Decimal::new(amount, 0),
            currency: "USDC".to_string(),
            source_account: source.to_string(),
            reference: reference.map(str::to_string),
        }
    }

    #[test]
    fn loads_fixture_json_and_rejects_duplicates() {
        let dataset = InMemoryFinancialDataset::from_json(
            r#"{
                "accounts": [{"id": "ops-account", "currency": "USDC", "balance": "100"}],
                "treasury": {"currency": "USDC", "total_balance": "100", "reserved": "0"}
            }"#,
        )
        .expect("fixture should load");
        let snapshot = dataset.snapshot().expect("snapshot");
        assert_eq!(snapshot.accounts[0].balance, Decimal::new(100, 0));
        assert!(snapshot.beneficiaries.is_empty());

        let duplicate = InMemoryFinancialDataset::from_json(
            r#"{
                "accounts": [
                    {"id": "a", "currency": "USDC", "balance": "1"},
                    {"id": "A", "currency": "USDC", "balance": "1"}
                ],
                "treasury": {"currency": "USDC", "total_balance": "2", "reserved": "0"}
            }"#,
        );
        assert!(matches!(duplicate, Err(ContextError::InvalidDataset(_))));
    }

    #[test]
    fn missing_dataset_file_is_unavailable() {
        let directory = tempfile::tempdir().expect("tempdir");
        let result = InMemoryFinancialDataset::from_path(&directory.path().join("missing.json"));
        assert!(matches!(result, Err(ContextError::Unavailable(_))));
    }

    #[tokio::test]
    async fn executing_a_transfer_debits_and_records_it() {
        let dataset = InMemoryFinancialDataset::demo();
        let chat = ChatId("chat-1".to_string());

        let receipt = dataset.execute(&chat, &item("ops-account", 500, None)).await.expect("transfer");
        assert!(receipt.transfer_id.starts_with("tx-"));
        assert_eq!(dataset.balance("ops-account"), Some(Decimal::new(249_500, 0)));

        let snapshot = dataset.snapshot().expect("snapshot");
        assert_eq!(snapshot.transfers.len(), 1);
        assert_eq!(snapshot.transfers[0].chat_id.as_deref(), Some("chat-1"));
        assert_eq!(snapshot.treasury.total_balance, Decimal::new(829_500, 0));
    }

    #[tokio::test]
    async fn paying_an_invoice_marks_it_paid() {
        let dataset = InMemoryFinancialDataset::demo();
        let chat = ChatId("chat-1".to_string());

        dataset.execute(&chat, &item("ops-account", 4_250, Some("INV-1001"))).await.expect("transfer");
        let snapshot = dataset.snapshot().expect("snapshot");
        let pending: Vec<&str> = snapshot
            .invoices
            .iter()
            .filter(|invoice| invoice.status == crate::context::InvoiceStatus::Pending)
            .map(|invoice| invoice.id.as_str())
            .collect();
        assert_eq!(pending, vec!["INV-1002"]);
    }

    #[tokio::test]
    async fn transfers_fail_without_side_effects() {
        let dataset = InMemoryFinancialDataset::demo();
        let chat = ChatId("chat-1".to_string());

        let unknown = dataset.execute(&chat, &item("nowhere", 5, None)).await;
        assert!(matches!(unknown, Err(TransferError::UnknownAccount(_))));

        let too_much = dataset.execute(&chat, &item("payroll", 90_000, None)).await;
        assert!(matches!(too_much, Err(TransferError::InsufficientFunds { .. })));
        assert_eq!(dataset.balance("payroll"), Some(Decimal::new(80_000, 0)));
        assert_eq!(dataset.transfer_count(), 0);
    }
}
