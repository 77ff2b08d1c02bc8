use std::sync::Arc;

use rulepay_core::audit::{AuditStore, AuditStoreError, AuditTrailBuilder, InMemoryAuditStore};
use rulepay_core::config::AppConfig;
use rulepay_core::context::InMemoryFinancialDataset;
use rulepay_core::domain::execution::{ChatId, ExecutionId, ExecutionStatus};
use rulepay_core::pipeline::ExecutionPipeline;
use rulepay_db::{connect_with_settings, migrations, SqlAuditTrailRepository};
use serde_json::json;

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

async fn sql_store() -> ContractResult<SqlAuditTrailRepository> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| format!("connect: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrate: {error}"))?;
    Ok(SqlAuditTrailRepository::new(pool))
}

/// Behaviour every audit store must share.
async fn check_append_only_contract(store: &dyn AuditStore) -> ContractResult {
    let execution_id = ExecutionId("exec-contract".to_string());
    let chat_id = ChatId("chat-contract".to_string());

    require!(store
        .attempts(&execution_id)
        .await
        .map_err(|error| error.to_string())?
        .is_empty());

    for attempt in 1..=3 {
        let record = AuditTrailBuilder::new(execution_id.clone(), chat_id.clone())
            .attempt(attempt)
            .invalid_request("ruleData is required")
            .build();
        store.append(&record).await.map_err(|error| format!("append {attempt}: {error}"))?;
    }

    let again = AuditTrailBuilder::new(execution_id.clone(), chat_id.clone())
        .attempt(2)
        .fault("late duplicate")
        .build();
    match store.append(&again).await {
        Err(AuditStoreError::AlreadyRecorded { attempt, .. }) => require_eq!(attempt, 2),
        other => return Err(format!("expected AlreadyRecorded, got {other:?}")),
    }

    let attempts = store.attempts(&execution_id).await.map_err(|error| error.to_string())?;
    require_eq!(attempts.iter().map(|record| record.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    require!(
        attempts.iter().all(|record| record.status == ExecutionStatus::InvalidRequest),
        "a rejected duplicate must not replace the stored attempt"
    );
    Ok(())
}

#[tokio::test]
async fn in_memory_store_honours_the_audit_contract() -> ContractResult {
    check_append_only_contract(&InMemoryAuditStore::default()).await
}

#[tokio::test]
async fn sql_store_honours_the_audit_contract() -> ContractResult {
    let store = sql_store().await?;
    check_append_only_contract(&store).await
}

#[tokio::test]
async fn replays_are_detected_through_the_sql_store() -> ContractResult {
    let store = Arc::new(sql_store().await?);
    let dataset = Arc::new(InMemoryFinancialDataset::demo());
    let pipeline = ExecutionPipeline::from_config(&AppConfig::default(), dataset.clone(), store.clone());
    let payload = json!({
        "chatId": "chat-ops",
        "executionId": "delivery-7",
        "ruleData": {
            "payment": {
                "action": "simple",
                "source": "ops-account",
                "amount": 1200,
                "currency": "USDC",
                "beneficiary": ["biz-legal"]
            },
            "execution": { "timing": "once" }
        }
    });

    let first = pipeline.execute(&payload).await;
    let replay = pipeline.execute(&payload).await;

    require_eq!(first.execution.status, ExecutionStatus::Success);
    require_eq!(replay.execution.status, ExecutionStatus::DuplicateExecution);
    require_eq!(replay.execution.replay_of, Some(1));
    require_eq!(dataset.transfer_count(), 1);

    let stored = store
        .attempts(&ExecutionId("delivery-7".to_string()))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(stored.len(), 2);
    require_eq!(stored[0], first.execution);
    Ok(())
}
