pub mod audit;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod formula;
pub mod intake;
pub mod pipeline;
pub mod policy;
pub mod processor;
pub mod resolver;
pub mod signature;
pub mod validation;

pub use audit::{AuditStore, AuditStoreError, AuditTrailBuilder, ExecutionRecord, InMemoryAuditStore};
pub use context::{ContextError, ContextProvider, FinancialSnapshot, InMemoryFinancialDataset};
pub use domain::execution::{ChatId, ExecutionId, ExecutionStatus};
pub use domain::payment::{PaymentItem, PolicyType, PolicyViolation, Severity};
pub use domain::rule::{AmountSpec, Condition, ExecutionSpec, PaymentAction, PaymentSpec, RuleData};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use intake::{RuleIntake, RuleParser, Scheduler};
pub use pipeline::{DryRun, ExecuteRequest, ExecuteResponse, ExecutionPipeline};
pub use policy::{BatchPolicyValidator, PolicyValidationResult};
pub use processor::{BatchPaymentProcessor, ExecutionResult, PaymentExecutor};
pub use resolver::{IssueCode, PaymentResolver, ResolutionResult};
pub use validation::validate_rule;
