//! Rule intake: natural-language parsing and conflict detection are external
//! collaborators; the core only validates their output and schedules it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::domain::execution::ChatId;
use crate::domain::rule::{ExecutionTiming, RuleData};
use crate::validation::validate_rule;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCandidate {
    pub rule: RuleData,
    /// Parser's own restatement of the instruction, shown for confirmation.
    #[serde(default)]
    pub interpretation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConflict {
    pub existing_index: usize,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub conflicts: Vec<RuleConflict>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ScheduleWhen {
    At(DateTime<Utc>),
    Cron(String),
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("rule parser failed: {0}")]
    Parser(String),
    #[error("scheduler failed: {0}")]
    Scheduler(String),
    #[error("rule is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("rule conflicts with {} existing rule(s)", .0.conflicts.len())]
    Conflicting(ConflictReport),
}

#[async_trait]
pub trait RuleParser: Send + Sync {
    async fn parse(&self, text: &str) -> Result<RuleCandidate, IntakeError>;

    async fn detect_conflicts(
        &self,
        rule: &RuleData,
        existing: &[RuleData],
    ) -> Result<ConflictReport, IntakeError>;
}

/// External delivery service that later invokes `POST /execute` with the
/// enqueued payload.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn enqueue(&self, payload: &Value, when: &ScheduleWhen) -> Result<String, IntakeError>;

    async fn cancel(&self, schedule_id: &str) -> Result<(), IntakeError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Scheduling {
    Scheduled { schedule_id: String, when: ScheduleWhen },
    /// Hook rules run when their events fire; nothing is enqueued.
    Hooks { hooks: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedRule {
    pub rule: RuleData,
    pub interpretation: String,
    pub scheduling: Scheduling,
}

#[derive(Clone)]
pub struct RuleIntake {
    parser: Arc<dyn RuleParser>,
    scheduler: Arc<dyn Scheduler>,
}

impl RuleIntake {
    pub fn new(parser: Arc<dyn RuleParser>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { parser, scheduler }
    }

    /// Parses `text`, then accepts the candidate.
    pub async fn submit(
        &self,
        chat_id: &ChatId,
        text: &str,
        existing: &[RuleData],
        now: DateTime<Utc>,
    ) -> Result<AcceptedRule, IntakeError> {
        let candidate = self.parser.parse(text).await?;
        self.accept(chat_id, candidate, existing, now).await
    }

    /// Validates, conflict-checks and schedules an already parsed rule.
    pub async fn accept(
        &self,
        chat_id: &ChatId,
        candidate: RuleCandidate,
        existing: &[RuleData],
        now: DateTime<Utc>,
    ) -> Result<AcceptedRule, IntakeError> {
        let RuleCandidate { rule, interpretation } = candidate;
        validate_rule(&rule, now).map_err(IntakeError::Invalid)?;

        let report = self.parser.detect_conflicts(&rule, existing).await?;
        if report.has_conflicts() {
            return Err(IntakeError::Conflicting(report));
        }

        let scheduling = match when_for(&rule)? {
            Some(when) => {
                let payload = json!({ "chatId": chat_id, "ruleData": rule });
                let schedule_id = self.scheduler.enqueue(&payload, &when).await?;
                Scheduling::Scheduled { schedule_id, when }
            }
            None => Scheduling::Hooks { hooks: rule.execution.hooks.clone().unwrap_or_default() },
        };

        info!(
            event_name = "intake.rule.accepted",
            chat_id = %chat_id,
            action = rule.payment.action.as_str(),
            timing = ?rule.execution.timing,
            "rule accepted"
        );
        Ok(AcceptedRule { rule, interpretation, scheduling })
    }

    pub async fn withdraw(&self, schedule_id: &str) -> Result<(), IntakeError> {
        self.scheduler.cancel(schedule_id).await
    }
}

fn when_for(rule: &RuleData) -> Result<Option<ScheduleWhen>, IntakeError> {
    let execution = &rule.execution;
    match execution.timing {
        ExecutionTiming::Once => execution
            .at
            .and_then(|at| DateTime::<Utc>::from_timestamp(at, 0))
            .map(|at| Some(ScheduleWhen::At(at)))
            .ok_or_else(|| IntakeError::Invalid(vec!["execution.at: not a valid timestamp".to_string()])),
        ExecutionTiming::Schedule => execution
            .cron
            .clone()
            .map(|cron| Some(ScheduleWhen::Cron(cron)))
            .ok_or_else(|| IntakeError::Invalid(vec!["execution.cron: required for `schedule`".to_string()])),
        ExecutionTiming::Hook => Ok(None),
    }
}
