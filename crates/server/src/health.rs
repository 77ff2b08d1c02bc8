use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use rulepay_core::context::ContextProvider;
use rulepay_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub dataset: Arc<dyn ContextProvider>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub dataset: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let dataset = dataset_check(state.dataset.as_ref());
    let ready = database.status == "ready" && dataset.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "rulepay-server runtime initialized".to_string(),
        },
        database,
        dataset,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match rulepay_db::ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn dataset_check(dataset: &dyn ContextProvider) -> HealthCheck {
    match dataset.snapshot() {
        Ok(snapshot) => HealthCheck {
            status: "ready",
            detail: format!(
                "{} accounts, {} beneficiaries",
                snapshot.accounts.len(),
                snapshot.beneficiaries.len()
            ),
        },
        Err(error) => HealthCheck { status: "degraded", detail: error.to_string() },
    }
}
