use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rulepay_core::audit::InMemoryAuditStore;
use rulepay_core::context::InMemoryFinancialDataset;
use rulepay_core::domain::execution::ChatId;
use rulepay_core::domain::rule::RuleData;
use rulepay_core::pipeline::{DryRun, ExecutionPipeline};
use rulepay_core::validation::validate_rule;
use serde::Serialize;

use crate::commands::{load_config, read_json, CommandResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveReport {
    chat_id: String,
    /// Intake-time findings. A rule can still resolve while these are present.
    validation_issues: Vec<String>,
    dry_run: DryRun,
}

/// Resolves `ruleData` and runs policy checks against the configured dataset.
/// Nothing is executed and no audit record is written.
pub fn run(path: &Path, chat_id: &str) -> CommandResult {
    let config = match load_config("resolve") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let document = match read_json("resolve", path) {
        Ok(document) => document,
        Err(failure) => return failure,
    };

    // Accept either a bare rule or a whole execute payload.
    let rule_value = document.get("ruleData").cloned().unwrap_or(document);
    let rule: RuleData = match serde_json::from_value(rule_value) {
        Ok(rule) => rule,
        Err(error) => {
            return CommandResult::failure(
                "resolve",
                "input",
                format!("ruleData is malformed: {error}"),
                6,
            );
        }
    };

    let dataset = match InMemoryFinancialDataset::load(config.pipeline.dataset_path.as_deref()) {
        Ok(dataset) => Arc::new(dataset),
        Err(error) => return CommandResult::failure("resolve", "dataset", error.to_string(), 4),
    };

    let pipeline =
        ExecutionPipeline::from_config(&config, dataset, Arc::new(InMemoryAuditStore::default()));
    let chat_id = ChatId(chat_id.to_string());
    let dry_run = pipeline.dry_run(&chat_id, &rule);

    // Executing would be a policy violation unless every item is approved.
    let approved = dry_run.resolution.success
        && dry_run
            .policy
            .as_ref()
            .is_some_and(|policy| policy.success && !policy.successful_items.is_empty());
    let status = if !dry_run.resolution.success {
        "resolution_failed"
    } else if approved {
        "ok"
    } else {
        "rejected"
    };

    let report = ResolveReport {
        chat_id: chat_id.0,
        validation_issues: validate_rule(&rule, Utc::now()).err().unwrap_or_default(),
        dry_run,
    };
    CommandResult::report("resolve", status, &report, if approved { 0 } else { 1 })
}
