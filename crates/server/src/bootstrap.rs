use std::sync::Arc;

use rulepay_core::config::{AppConfig, ConfigError, LoadOptions};
use rulepay_core::context::{ContextError, InMemoryFinancialDataset};
use rulepay_core::pipeline::ExecutionPipeline;
use rulepay_db::{connect_with_config, migrations, DbPool, SqlAuditTrailRepository};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub dataset: Arc<InMemoryFinancialDataset>,
    pub pipeline: ExecutionPipeline,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("financial dataset could not be loaded: {0}")]
    Dataset(#[source] ContextError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let dataset = Arc::new(
        InMemoryFinancialDataset::load(config.pipeline.dataset_path.as_deref())
            .map_err(BootstrapError::Dataset)?,
    );
    info!(
        event_name = "system.bootstrap.dataset_loaded",
        correlation_id = "bootstrap",
        dataset = %config
            .pipeline
            .dataset_path
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "demo".to_string()),
        "financial dataset loaded"
    );

    let store = Arc::new(SqlAuditTrailRepository::new(db_pool.clone()));
    let pipeline = ExecutionPipeline::from_config(&config, dataset.clone(), store);

    Ok(Application { config, db_pool, dataset, pipeline })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use rulepay_core::config::{ConfigOverrides, LoadOptions};
    use serde_json::json;

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_on_a_short_signing_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                signing_secret: Some("short".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("scheduler.signing_secret"));
    }

    #[tokio::test]
    async fn bootstrap_rejects_a_broken_dataset_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"{ \"accounts\": [] }").expect("write dataset");

        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                dataset_path: Some(PathBuf::from(file.path())),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("financial dataset could not be loaded"));
    }

    #[tokio::test]
    async fn integration_smoke_covers_startup_and_one_execution() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with defaults");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name = 'execution_audit_trail'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("audit table should exist after bootstrap");
        assert_eq!(table_count, 1);

        let response = app
            .pipeline
            .execute(&json!({
                "chatId": "chat-smoke",
                "ruleData": {
                    "payment": {
                        "action": "batch",
                        "source": "payroll",
                        "amount": { "source": "employees.salary" },
                        "currency": "USDC",
                        "beneficiary": "employees"
                    },
                    "execution": { "timing": "once" }
                }
            }))
            .await;
        assert!(response.success, "{:?}", response.message);
        assert!(app.dataset.transfer_count() > 0);

        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM execution_audit_trail")
            .fetch_one(&app.db_pool)
            .await
            .expect("count audit rows");
        assert_eq!(stored, 1);

        app.db_pool.close().await;
    }
}
