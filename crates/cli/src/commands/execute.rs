use std::path::Path;
use std::sync::Arc;

use rulepay_core::context::InMemoryFinancialDataset;
use rulepay_core::pipeline::ExecutionPipeline;
use rulepay_db::{connect_with_config, migrations, SqlAuditTrailRepository};

use crate::commands::{load_config, read_json, runtime, CommandResult};

/// Runs one `{chatId, ruleData}` payload through the whole pipeline. Transfers
/// land in the process-local dataset; the audit record lands in the database.
pub fn run(path: &Path) -> CommandResult {
    let config = match load_config("execute") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let payload = match read_json("execute", path) {
        Ok(payload) => payload,
        Err(failure) => return failure,
    };
    let dataset = match InMemoryFinancialDataset::load(config.pipeline.dataset_path.as_deref()) {
        Ok(dataset) => Arc::new(dataset),
        Err(error) => return CommandResult::failure("execute", "dataset", error.to_string(), 4),
    };
    let runtime = match runtime("execute") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let store = Arc::new(SqlAuditTrailRepository::new(pool.clone()));
        let pipeline = ExecutionPipeline::from_config(&config, dataset, store);
        let response = pipeline.execute(&payload).await;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(response)
    });

    match result {
        Ok(response) => {
            let status = response.execution.status.as_str().to_ascii_lowercase();
            let exit_code = if response.success { 0 } else { 1 };
            CommandResult::report("execute", &status, &response, exit_code)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("execute", error_class, message, exit_code)
        }
    }
}
