//! `POST /execute`: the scheduler's invocation endpoint. Only an unverifiable
//! signature is answered with a non-200 status; every other outcome travels
//! in the body's `execution.status`.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use rulepay_core::domain::execution::ExecutionId;
use rulepay_core::errors::ApplicationError;
use rulepay_core::pipeline::ExecutionPipeline;
use rulepay_core::signature::{self, SIGNATURE_HEADER};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Clone)]
pub struct ExecuteState {
    pub pipeline: ExecutionPipeline,
    pub signing_secret: Option<SecretString>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectedRequest {
    success: bool,
    error: &'static str,
    correlation_id: String,
}

pub fn router(state: ExecuteState) -> Router {
    Router::new().route("/execute", post(execute)).with_state(state)
}

pub async fn execute(
    State(state): State<ExecuteState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.signing_secret {
        let header = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());
        if let Err(error) = signature::verify(secret.expose_secret().as_bytes(), &body, header) {
            let correlation_id = ExecutionId::generate().0;
            warn!(
                event_name = "http.execute.signature_rejected",
                correlation_id = %correlation_id,
                error = %error,
                "rejected unsigned or mis-signed execute request"
            );
            let interface = ApplicationError::from(error).into_interface(correlation_id);
            let status = match interface {
                rulepay_core::InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let rejected = RejectedRequest {
                success: false,
                error: interface.user_message(),
                correlation_id: interface.correlation_id().to_string(),
            };
            return (status, Json(rejected)).into_response();
        }
    }

    // Undecodable bodies still get an audited INVALID_REQUEST answer.
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    let response = state.pipeline.execute(&payload).await;
    (StatusCode::OK, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use rulepay_core::audit::InMemoryAuditStore;
    use rulepay_core::config::AppConfig;
    use rulepay_core::context::InMemoryFinancialDataset;
    use rulepay_core::pipeline::ExecutionPipeline;
    use rulepay_core::signature::{sign, SIGNATURE_HEADER};
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, ExecuteState};

    const SECRET: &str = "scheduler-shared-secret";

    fn app(signing_secret: Option<&str>) -> (Router, Arc<InMemoryFinancialDataset>) {
        let dataset = Arc::new(InMemoryFinancialDataset::demo());
        let pipeline = ExecutionPipeline::from_config(
            &AppConfig::default(),
            dataset.clone(),
            Arc::new(InMemoryAuditStore::default()),
        );
        let state = ExecuteState {
            pipeline,
            signing_secret: signing_secret.map(|secret| SecretString::from(secret.to_string())),
        };
        (router(state), dataset)
    }

    fn payload(amount: i64) -> Value {
        json!({
            "chatId": "chat-http",
            "ruleData": {
                "payment": {
                    "action": "simple",
                    "source": "ops-account",
                    "amount": amount,
                    "currency": "USDC",
                    "beneficiary": ["wallet-A"]
                },
                "execution": { "timing": "once" }
            }
        })
    }

    async fn post(router: Router, body: Vec<u8>, signature: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response = router
            .oneshot(request.body(Body::from(body)).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn successful_execution_is_answered_with_the_record() {
        let (router, dataset) = app(None);

        let (status, body) = post(router, payload(500).to_string().into_bytes(), None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["chatId"], "chat-http");
        assert_eq!(body["execution"]["status"], "SUCCESS");
        assert_eq!(
            body["execution"]["executionResult"]["successfulPayments"].as_array().map(Vec::len),
            Some(1)
        );
        assert_eq!(dataset.transfer_count(), 1);
    }

    #[tokio::test]
    async fn business_failures_still_answer_200() {
        let (router, dataset) = app(None);

        // Above the large-transaction threshold, so every item is rejected.
        let (status, body) = post(router.clone(), payload(60_000).to_string().into_bytes(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["execution"]["status"], "POLICY_VIOLATION");
        assert!(body["message"].is_string());

        let (status, body) = post(router.clone(), json!({ "ruleData": {} }).to_string().into_bytes(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["execution"]["status"], "INVALID_REQUEST");

        let (status, body) = post(router, b"not json".to_vec(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["execution"]["status"], "INVALID_REQUEST");

        assert_eq!(dataset.transfer_count(), 0);
    }

    #[tokio::test]
    async fn signatures_are_enforced_when_a_secret_is_configured() {
        let (router, dataset) = app(Some(SECRET));
        let body = payload(500).to_string().into_bytes();

        let (status, rejected) = post(router.clone(), body.clone(), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(rejected["success"], false);
        assert!(rejected["correlationId"].as_str().is_some_and(|id| id.starts_with("exec-")));

        let forged = sign(b"some-other-secret-value", &body).expect("sign");
        let (status, _) = post(router.clone(), body.clone(), Some(forged)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(dataset.transfer_count(), 0);

        let valid = sign(SECRET.as_bytes(), &body).expect("sign");
        let (status, accepted) = post(router, body, Some(valid)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["execution"]["status"], "SUCCESS");
        assert_eq!(dataset.transfer_count(), 1);
    }
}
