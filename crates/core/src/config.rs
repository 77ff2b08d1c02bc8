use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub policy: PolicyConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Wall-clock budget for one execution attempt.
    pub timeout_secs: u64,
    /// JSON dataset fixture; the built-in demo dataset is used when unset.
    pub dataset_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Trailing 24h cap for accounts without their own `daily_limit`.
    pub default_daily_limit: Decimal,
    pub large_transaction_threshold: Decimal,
    pub duplicate_lookback_secs: u64,
    pub supported_currencies: Vec<String>,
    pub allow_unlisted_beneficiaries: bool,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// HMAC key for `x-rulepay-signature`. Signature checks are off when unset.
    pub signing_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub dataset_path: Option<PathBuf>,
    pub signing_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://rulepay.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            pipeline: PipelineConfig { timeout_secs: 30, dataset_path: None },
            policy: PolicyConfig::default(),
            scheduler: SchedulerConfig { signing_secret: None },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: Decimal::new(100_000, 0),
            large_transaction_threshold: Decimal::new(50_000, 0),
            duplicate_lookback_secs: 86_400,
            supported_currencies: vec!["USDC".to_string(), "USDT".to_string(), "USD".to_string()],
            allow_unlisted_beneficiaries: true,
        }
    }
}

impl PolicyConfig {
    pub fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies.iter().any(|supported| supported.eq_ignore_ascii_case(currency.trim()))
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("rulepay.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(timeout_secs) = pipeline.timeout_secs {
                self.pipeline.timeout_secs = timeout_secs;
            }
            if let Some(dataset_path) = pipeline.dataset_path {
                self.pipeline.dataset_path = Some(dataset_path);
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(limit) = policy.default_daily_limit {
                self.policy.default_daily_limit = limit;
            }
            if let Some(threshold) = policy.large_transaction_threshold {
                self.policy.large_transaction_threshold = threshold;
            }
            if let Some(lookback) = policy.duplicate_lookback_secs {
                self.policy.duplicate_lookback_secs = lookback;
            }
            if let Some(currencies) = policy.supported_currencies {
                self.policy.supported_currencies = currencies;
            }
            if let Some(allow) = policy.allow_unlisted_beneficiaries {
                self.policy.allow_unlisted_beneficiaries = allow;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            if let Some(signing_secret_value) = scheduler.signing_secret {
                self.scheduler.signing_secret = Some(secret_value(signing_secret_value));
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RULEPAY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RULEPAY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("RULEPAY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RULEPAY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("RULEPAY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RULEPAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RULEPAY_SERVER_PORT") {
            self.server.port = parse_env("RULEPAY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("RULEPAY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("RULEPAY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("RULEPAY_PIPELINE_TIMEOUT_SECS") {
            self.pipeline.timeout_secs = parse_env("RULEPAY_PIPELINE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RULEPAY_PIPELINE_DATASET_PATH") {
            self.pipeline.dataset_path = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("RULEPAY_POLICY_DEFAULT_DAILY_LIMIT") {
            self.policy.default_daily_limit =
                parse_decimal("RULEPAY_POLICY_DEFAULT_DAILY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("RULEPAY_POLICY_LARGE_TRANSACTION_THRESHOLD") {
            self.policy.large_transaction_threshold =
                parse_decimal("RULEPAY_POLICY_LARGE_TRANSACTION_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("RULEPAY_POLICY_DUPLICATE_LOOKBACK_SECS") {
            self.policy.duplicate_lookback_secs =
                parse_env("RULEPAY_POLICY_DUPLICATE_LOOKBACK_SECS", &value)?;
        }
        if let Some(value) = read_env("RULEPAY_POLICY_SUPPORTED_CURRENCIES") {
            self.policy.supported_currencies = value
                .split(',')
                .map(|currency| currency.trim().to_ascii_uppercase())
                .filter(|currency| !currency.is_empty())
                .collect();
        }
        if let Some(value) = read_env("RULEPAY_POLICY_ALLOW_UNLISTED_BENEFICIARIES") {
            self.policy.allow_unlisted_beneficiaries =
                parse_env("RULEPAY_POLICY_ALLOW_UNLISTED_BENEFICIARIES", &value)?;
        }

        if let Some(value) = read_env("RULEPAY_SCHEDULER_SIGNING_SECRET") {
            self.scheduler.signing_secret = Some(secret_value(value));
        }

        let log_level = read_env("RULEPAY_LOGGING_LEVEL").or_else(|| read_env("RULEPAY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RULEPAY_LOGGING_FORMAT").or_else(|| read_env("RULEPAY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(dataset_path) = overrides.dataset_path {
            self.pipeline.dataset_path = Some(dataset_path);
        }
        if let Some(signing_secret) = overrides.signing_secret {
            self.scheduler.signing_secret = Some(secret_value(signing_secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_pipeline(&self.pipeline)?;
        validate_policy(&self.policy)?;
        validate_scheduler(&self.scheduler)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("rulepay.toml"), PathBuf::from("config/rulepay.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.timeout_secs == 0 || pipeline.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "pipeline.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if let Some(path) = &pipeline.dataset_path {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "pipeline.dataset_path must not be empty when set".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<(), ConfigError> {
    if policy.default_daily_limit <= Decimal::ZERO {
        return Err(ConfigError::Validation(
            "policy.default_daily_limit must be greater than zero".to_string(),
        ));
    }

    if policy.large_transaction_threshold <= Decimal::ZERO {
        return Err(ConfigError::Validation(
            "policy.large_transaction_threshold must be greater than zero".to_string(),
        ));
    }

    if policy.supported_currencies.iter().all(|currency| currency.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "policy.supported_currencies must list at least one currency".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if let Some(secret) = &scheduler.signing_secret {
        if secret.expose_secret().trim().len() < 16 {
            return Err(ConfigError::Validation(
                "scheduler.signing_secret must be at least 16 characters".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_env(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

/// Parses a numeric or boolean override; the target type comes from the field.
fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| invalid_env(key, value))
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(value.trim()).map_err(|_| invalid_env(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    pipeline: Option<PipelinePatch>,
    policy: Option<PolicyPatch>,
    scheduler: Option<SchedulerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    timeout_secs: Option<u64>,
    dataset_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    default_daily_limit: Option<Decimal>,
    large_transaction_threshold: Option<Decimal>,
    duplicate_lookback_secs: Option<u64>,
    supported_currencies: Option<Vec<String>>,
    allow_unlisted_beneficiaries: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    signing_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
