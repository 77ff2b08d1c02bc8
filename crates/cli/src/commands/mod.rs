pub mod config;
pub mod doctor;
pub mod execute;
pub mod migrate;
pub mod resolve;
pub mod sign;

use std::fs;
use std::path::Path;

use rulepay_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct CommandReport<'a, T: Serialize> {
    command: &'a str,
    status: &'a str,
    report: &'a T,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Structured result carrying a full report body, e.g. a dry run.
    pub fn report<T: Serialize>(command: &str, status: &str, report: &T, exit_code: u8) -> Self {
        let payload = CommandReport { command, status, report };
        match serde_json::to_string_pretty(&payload) {
            Ok(output) => Self { exit_code, output },
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })
}

pub(crate) fn runtime(command: &str) -> Result<Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

pub(crate) fn read_input(command: &str, path: &Path) -> Result<Vec<u8>, CommandResult> {
    fs::read(path).map_err(|error| {
        CommandResult::failure(
            command,
            "input",
            format!("failed to read `{}`: {error}", path.display()),
            6,
        )
    })
}

pub(crate) fn read_json(command: &str, path: &Path) -> Result<Value, CommandResult> {
    let raw = read_input(command, path)?;
    serde_json::from_slice(&raw).map_err(|error| {
        CommandResult::failure(
            command,
            "input",
            format!("`{}` is not valid JSON: {error}", path.display()),
            6,
        )
    })
}
