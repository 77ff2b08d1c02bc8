use thiserror::Error;

use crate::audit::AuditStoreError;
use crate::context::{ContextError, UnknownReferenceError};
use crate::formula::FormulaError;
use crate::intake::IntakeError;
use crate::signature::SignatureError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("rule rejected: {}", .0.join("; "))]
    InvalidRule(Vec<String>),
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    UnknownReference(#[from] UnknownReferenceError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("authentication failure: {0}")]
    Authentication(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Unauthorized { .. } => "The request signature could not be verified.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Unauthorized { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Unauthorized { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ContextError> for ApplicationError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::Unavailable(message) => Self::Integration(message),
            ContextError::InvalidDataset(message) => Self::Configuration(message),
        }
    }
}

impl From<AuditStoreError> for ApplicationError {
    fn from(value: AuditStoreError) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<SignatureError> for ApplicationError {
    fn from(value: SignatureError) -> Self {
        match value {
            SignatureError::InvalidSecret => Self::Configuration(value.to_string()),
            other => Self::Authentication(other.to_string()),
        }
    }
}

impl From<IntakeError> for ApplicationError {
    fn from(value: IntakeError) -> Self {
        match value {
            IntakeError::Invalid(errors) => Self::Domain(DomainError::InvalidRule(errors)),
            IntakeError::Conflicting(report) => Self::Domain(DomainError::InvariantViolation(
                report
                    .conflicts
                    .iter()
                    .map(|conflict| conflict.reason.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
            other @ (IntakeError::Parser(_) | IntakeError::Scheduler(_)) => {
                Self::Integration(other.to_string())
            }
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Authentication(message) => {
                Self::Unauthorized { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
