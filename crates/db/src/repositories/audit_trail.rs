use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use rulepay_core::audit::{AuditStore, AuditStoreError, ExecutionRecord};
use rulepay_core::domain::execution::{ChatId, ExecutionId, ExecutionStatus};

use super::RepositoryError;
use crate::DbPool;

/// Append-only audit trail. The table's triggers refuse UPDATE and DELETE, so
/// a stored attempt can only ever be read back.
#[derive(Clone)]
pub struct SqlAuditTrailRepository {
    pool: DbPool,
}

/// Indexed columns of one stored attempt, without the full record body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditTrailEntry {
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub chat_id: ChatId,
    pub status: ExecutionStatus,
    pub summary: String,
    pub recorded_at: DateTime<Utc>,
}

impl SqlAuditTrailRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recent attempts for a chat, newest first.
    pub async fn list_for_chat(
        &self,
        chat_id: &ChatId,
        limit: u32,
    ) -> Result<Vec<AuditTrailEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                execution_id,
                attempt,
                chat_id,
                status,
                summary,
                recorded_at
             FROM execution_audit_trail
             WHERE chat_id = ?
             ORDER BY recorded_at DESC, attempt DESC
             LIMIT ?",
        )
        .bind(&chat_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn insert(&self, record: &ExecutionRecord) -> Result<(), sqlx::Error> {
        let record_json = serde_json::to_string(record)
            .map_err(|error| sqlx::Error::Encode(Box::new(error)))?;

        sqlx::query(
            "INSERT INTO execution_audit_trail (
                execution_id,
                attempt,
                chat_id,
                status,
                replay_of,
                summary,
                recorded_at,
                record_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.execution_id.0)
        .bind(i64::from(record.attempt))
        .bind(&record.chat_id.0)
        .bind(record.status.as_str())
        .bind(record.replay_of.map(i64::from))
        .bind(&record.summary)
        .bind(record.timestamp.to_rfc3339())
        .bind(record_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for SqlAuditTrailRepository {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), AuditStoreError> {
        match self.insert(record).await {
            Ok(()) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(AuditStoreError::AlreadyRecorded {
                    execution_id: record.execution_id.clone(),
                    attempt: record.attempt,
                })
            }
            Err(sqlx::Error::Encode(error)) => Err(AuditStoreError::Encoding(error.to_string())),
            Err(error) => Err(RepositoryError::from(error).into()),
        }
    }

    async fn attempts(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ExecutionRecord>, AuditStoreError> {
        let rows = sqlx::query(
            "SELECT record_json
             FROM execution_audit_trail
             WHERE execution_id = ?
             ORDER BY attempt ASC",
        )
        .bind(&execution_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let records: Result<Vec<ExecutionRecord>, RepositoryError> =
            rows.into_iter().map(record_from_row).collect();
        Ok(records?)
    }
}

fn record_from_row(row: SqliteRow) -> Result<ExecutionRecord, RepositoryError> {
    let raw = row.try_get::<String, _>("record_json")?;
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid record_json: {error}")))
}

fn entry_from_row(row: SqliteRow) -> Result<AuditTrailEntry, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown execution status `{status_raw}`")))?;

    Ok(AuditTrailEntry {
        execution_id: ExecutionId(row.try_get("execution_id")?),
        attempt: parse_u32("attempt", row.try_get("attempt")?)?,
        chat_id: ChatId(row.try_get("chat_id")?),
        status,
        summary: row.try_get("summary")?,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use rulepay_core::audit::{AuditStore, AuditStoreError, AuditTrailBuilder, ExecutionRecord};
    use rulepay_core::domain::execution::{ChatId, ExecutionId, ExecutionStatus};

    use super::SqlAuditTrailRepository;
    use crate::migrations;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_audit_trail_round_trips_attempts_in_order() {
        let pool = setup_pool().await;
        let repo = SqlAuditTrailRepository::new(pool.clone());

        repo.append(&record("exec-1", 2, "2026-03-01T12:05:00Z")).await.expect("attempt 2");
        repo.append(&record("exec-1", 1, "2026-03-01T12:00:00Z")).await.expect("attempt 1");
        repo.append(&record("exec-2", 1, "2026-03-01T12:10:00Z")).await.expect("other execution");

        let attempts =
            repo.attempts(&ExecutionId("exec-1".to_string())).await.expect("load attempts");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0], record("exec-1", 1, "2026-03-01T12:00:00Z"));
        assert_eq!(attempts[1].attempt, 2);

        let listed =
            repo.list_for_chat(&ChatId("chat-1".to_string()), 10).await.expect("list for chat");
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].execution_id.0, "exec-2");
        assert_eq!(listed[0].status, ExecutionStatus::InvalidRequest);

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_audit_trail_refuses_rewrites() {
        let pool = setup_pool().await;
        let repo = SqlAuditTrailRepository::new(pool.clone());
        let first = record("exec-1", 1, "2026-03-01T12:00:00Z");
        repo.append(&first).await.expect("append");

        let duplicate = repo.append(&first).await;
        assert!(matches!(duplicate, Err(AuditStoreError::AlreadyRecorded { attempt: 1, .. })));

        let update = sqlx::query("UPDATE execution_audit_trail SET status = 'SUCCESS'")
            .execute(&pool)
            .await;
        assert!(update.is_err(), "updates must be rejected");

        let delete = sqlx::query("DELETE FROM execution_audit_trail").execute(&pool).await;
        assert!(delete.is_err(), "deletes must be rejected");

        let attempts =
            repo.attempts(&ExecutionId("exec-1".to_string())).await.expect("load attempts");
        assert_eq!(attempts, vec![first]);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn record(execution_id: &str, attempt: u32, at: &str) -> ExecutionRecord {
        AuditTrailBuilder::new(ExecutionId(execution_id.to_string()), ChatId("chat-1".to_string()))
            .attempt(attempt)
            .timestamp(parse_ts(at))
            .invalid_request("ruleData is required")
            .build()
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }
}
