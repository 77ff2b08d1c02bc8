pub mod execution;
pub mod payment;
pub mod rule;
