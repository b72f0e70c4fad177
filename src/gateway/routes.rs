//! HTTP endpoints for offloaded computation.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ApiError;
use crate::dispatch::Dispatcher;
use crate::process::WorkPayload;

/// Longest per-request timeout a caller may ask for.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
}

/// Build the Axum router for the gateway.
pub fn gateway_routes(dispatcher: Dispatcher) -> Router {
    let state = GatewayState { dispatcher };

    Router::new()
        .route("/health", get(health))
        .route("/compute", post(compute))
        .route("/api/dispatch", post(dispatch_work))
        .fallback(fallback)
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let stats = state.dispatcher.stats().await;
    let status = if state.dispatcher.is_shutting_down() {
        "draining"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "service": "compute-offload",
        "workers": stats,
    }))
}

async fn fallback() -> &'static str {
    "Ok"
}

// ── Compute ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SumRequest {
    a: Number,
    b: Number,
}

async fn compute(
    State(state): State<GatewayState>,
    body: Result<Json<SumRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let payload = WorkPayload::new("sum", serde_json::json!({ "a": req.a, "b": req.b }));

    let result = state
        .dispatcher
        .dispatch_default(payload)
        .await
        .inspect_err(|e| warn!(error = %e, "Compute request failed"))?;

    info!(correlation_id = %result.correlation_id, sum = %result.result, "Compute request done");
    Ok(format!("Sum is {}", result.result))
}

// ── Generic dispatch ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    op: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    correlation_id: Uuid,
    result: Value,
}

async fn dispatch_work(
    State(state): State<GatewayState>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    if req.op.trim().is_empty() {
        return Err(ApiError::bad_request("op must not be empty"));
    }
    let timeout = match req.timeout_ms {
        None => state.dispatcher.default_timeout(),
        Some(0) => return Err(ApiError::bad_request("timeout_ms must be positive")),
        Some(ms) => Duration::from_millis(ms).min(MAX_REQUEST_TIMEOUT),
    };

    debug!(op = %req.op, timeout = ?timeout, "Dispatch request");
    let result = state
        .dispatcher
        .dispatch(WorkPayload::new(req.op, req.args), timeout)
        .await
        .inspect_err(|e| warn!(error = %e, "Dispatch request failed"))?;

    Ok(Json(DispatchResponse {
        correlation_id: result.correlation_id,
        result: result.result,
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::DispatcherConfig;
    use crate::process::{ProgramRef, SpawnConfig, StdioMode};

    /// Answers every request with the number 5.
    const FIVE: &str = r#"read -r line; id=$(printf '%s' "$line" | sed 's/.*"correlation_id":"\([^"]*\)".*/\1/'); printf '{"type":"result","correlation_id":"%s","result":5}\n' "$id""#;

    fn router(script: &str) -> Router {
        let config = DispatcherConfig::new(ProgramRef::new("sh").args(["-c", script]))
            .with_spawn(SpawnConfig::default().with_stdio(StdioMode::Ignored))
            .with_default_timeout(Duration::from_secs(5))
            .with_reap_timeout(Duration::from_millis(500));
        gateway_routes(Dispatcher::new(config))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn compute_returns_sum_text() {
        let response = router(FIVE)
            .oneshot(post_json("/compute", r#"{"a": 2, "b": 3}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Sum is 5");
    }

    #[tokio::test]
    async fn compute_rejects_bad_body() {
        let response = router(FIVE)
            .oneshot(post_json("/compute", r#"{"a": "two"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], "invalid_request");
    }

    #[tokio::test]
    async fn dispatch_timeout_maps_to_504() {
        let response = router("exec sleep 30")
            .oneshot(post_json("/api/dispatch", r#"{"op": "sleep", "timeout_ms": 50}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], "timeout");
    }

    #[tokio::test]
    async fn dispatch_worker_exit_maps_to_502() {
        let response = router("exit 2")
            .oneshot(post_json("/api/dispatch", r#"{"op": "anything"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn oversized_args_are_rejected_without_waiting() {
        let big = "x".repeat(crate::process::protocol::MAX_LINE_BYTES + 100_000);
        let body = serde_json::json!({"op": "echo", "args": big, "timeout_ms": 5000}).to_string();

        let started = std::time::Instant::now();
        let response = router("exec sleep 30")
            .oneshot(post_json("/api/dispatch", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(started.elapsed() < Duration::from_secs(2));
        let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], "payload_rejected");
    }

    #[tokio::test]
    async fn dispatch_validates_request() {
        let app = router(FIVE);
        let empty_op = app
            .clone()
            .oneshot(post_json("/api/dispatch", r#"{"op": " "}"#))
            .await
            .unwrap();
        assert_eq!(empty_op.status(), StatusCode::BAD_REQUEST);

        let zero_timeout = app
            .oneshot(post_json("/api/dispatch", r#"{"op": "echo", "timeout_ms": 0}"#))
            .await
            .unwrap();
        assert_eq!(zero_timeout.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dispatch_returns_json_result() {
        let response = router(FIVE)
            .oneshot(post_json("/api/dispatch", r#"{"op": "sum", "args": {"a": 2, "b": 3}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["result"], 5);
        assert!(json["correlation_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn health_and_fallback() {
        let app = router(FIVE);
        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_string(health).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["workers"]["live_workers"], 0);

        let other = app
            .oneshot(Request::get("/anything/else").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
        assert_eq!(body_string(other).await, "Ok");
    }
}
