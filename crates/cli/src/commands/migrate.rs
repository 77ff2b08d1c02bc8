use crate::commands::{load_config, runtime, CommandResult};
use rulepay_db::{connect_with_config, migrations};

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let pending = migrations::pending_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<Vec<i64>, (&'static str, String, u8)>(pending)
    });

    match result {
        Ok(pending) if pending.is_empty() => {
            CommandResult::success("migrate", "schema already up to date")
        }
        Ok(pending) => CommandResult::success(
            "migrate",
            format!(
                "applied {} pending migration(s): {}",
                pending.len(),
                pending.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
