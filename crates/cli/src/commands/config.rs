use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rulepay_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let signing_secret = match &config.scheduler.signing_secret {
        Some(secret) => redact_secret(secret.expose_secret()),
        None => "<unset> (signature checks disabled)".to_string(),
    };
    let dataset_path = config
        .pipeline
        .dataset_path
        .as_deref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<built-in demo dataset>".to_string());

    let fields: [(&str, String, &[&str]); 16] = [
        ("database.url", config.database.url.clone(), &["RULEPAY_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["RULEPAY_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["RULEPAY_DATABASE_TIMEOUT_SECS"],
        ),
        ("server.bind_address", config.server.bind_address.clone(), &["RULEPAY_SERVER_BIND_ADDRESS"]),
        ("server.port", config.server.port.to_string(), &["RULEPAY_SERVER_PORT"]),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["RULEPAY_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        (
            "pipeline.timeout_secs",
            config.pipeline.timeout_secs.to_string(),
            &["RULEPAY_PIPELINE_TIMEOUT_SECS"],
        ),
        ("pipeline.dataset_path", dataset_path, &["RULEPAY_PIPELINE_DATASET_PATH"]),
        (
            "policy.default_daily_limit",
            config.policy.default_daily_limit.to_string(),
            &["RULEPAY_POLICY_DEFAULT_DAILY_LIMIT"],
        ),
        (
            "policy.large_transaction_threshold",
            config.policy.large_transaction_threshold.to_string(),
            &["RULEPAY_POLICY_LARGE_TRANSACTION_THRESHOLD"],
        ),
        (
            "policy.duplicate_lookback_secs",
            config.policy.duplicate_lookback_secs.to_string(),
            &["RULEPAY_POLICY_DUPLICATE_LOOKBACK_SECS"],
        ),
        (
            "policy.supported_currencies",
            config.policy.supported_currencies.join(","),
            &["RULEPAY_POLICY_SUPPORTED_CURRENCIES"],
        ),
        (
            "policy.allow_unlisted_beneficiaries",
            config.policy.allow_unlisted_beneficiaries.to_string(),
            &["RULEPAY_POLICY_ALLOW_UNLISTED_BENEFICIARIES"],
        ),
        ("scheduler.signing_secret", signing_secret, &["RULEPAY_SCHEDULER_SIGNING_SECRET"]),
        (
            "logging.level",
            config.logging.level.clone(),
            &["RULEPAY_LOGGING_LEVEL", "RULEPAY_LOG_LEVEL"],
        ),
        (
            "logging.format",
            config.logging.format.as_str().to_string(),
            &["RULEPAY_LOGGING_FORMAT", "RULEPAY_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in fields {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("rulepay.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/rulepay.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps the first four characters so operators can tell secrets apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}
