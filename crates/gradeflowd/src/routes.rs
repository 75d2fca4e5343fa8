//! HTTP surface: the sandbox callback webhook and plugin listings.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gradeflow_core::sandbox::JudgeResult;
use gradeflow_core::{
    categories, Callback, CallbackDisposition, CallbackKind, PluginCategory, PluginInfo,
    PluginRegistry, SandboxMachine,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PluginRegistry>,
    /// Absent when no sandbox service is configured.
    pub machine: Option<Arc<SandboxMachine>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/plugins", get(list_plugins))
        .route("/api/v1/plugins/categories", get(list_categories))
        .route("/api/v1/plugins/test-runner/callback", post(sandbox_callback))
        .with_state(state)
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message),
        };
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginInfo>> {
    Json(state.registry.list())
}

async fn list_categories() -> Json<Vec<PluginCategory>> {
    Json(categories())
}

/// Identity the sandbox service echoes back on the callback URL.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    assessment: Option<String>,
    criterion: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallbackAck {
    status: &'static str,
}

fn disposition_label(disposition: CallbackDisposition) -> &'static str {
    match disposition {
        CallbackDisposition::Advanced(_) => "advanced",
        CallbackDisposition::Completed => "completed",
        CallbackDisposition::Ignored => "ignored",
        CallbackDisposition::Dropped => "dropped",
        CallbackDisposition::Rejected => "rejected",
    }
}

/// `POST /api/v1/plugins/test-runner/callback?type=&id=&assessment=&criterion=`
/// with the judge's result array as the body.
async fn sandbox_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    Json(results): Json<Vec<JudgeResult>>,
) -> Result<Json<CallbackAck>, ApiError> {
    let machine = state
        .machine
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("test-runner is not configured".to_string()))?;
    let kind: CallbackKind = query.kind.parse().map_err(ApiError::BadRequest)?;

    let callback = Callback {
        kind,
        attempt_id: query.id,
        assessment_id: query.assessment.filter(|s| !s.is_empty()),
        criterion_name: query.criterion.filter(|s| !s.is_empty()),
        results,
    };
    let attempt_id = callback.attempt_id.clone();
    let disposition = machine.handle_callback(callback).await.map_err(|e| {
        error!(attempt_id = %attempt_id, error = %e, "callback handling failed");
        ApiError::Internal(e.to_string())
    })?;

    if !disposition.is_accepted() {
        warn!(attempt_id = %attempt_id, "rejecting callback for unknown attempt");
        return Err(ApiError::NotFound(format!("unknown attempt {attempt_id}")));
    }
    Ok(Json(CallbackAck {
        status: disposition_label(disposition),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gradeflow_core::fakes::{MemoryTransport, RecordingSandboxClient};
    use gradeflow_core::plugins::config::{parse_config, TestRunnerConfig};
    use gradeflow_core::{
        Criterion, ResultEmitter, RetryPolicy, SandboxSettings, SandboxStep, StartAttempt,
        UnknownCallbackPolicy,
    };
    use gradeflow_state::fakes::MemoryKvStore;
    use tower::ServiceExt;

    fn machine(policy: UnknownCallbackPolicy) -> Arc<SandboxMachine> {
        let emitter = Arc::new(ResultEmitter::new(
            Arc::new(MemoryTransport::new()),
            RetryPolicy {
                max_attempts: 1,
                backoff_base_ms: 1,
            },
        ));
        Arc::new(SandboxMachine::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(RecordingSandboxClient::new()),
            emitter,
            SandboxSettings {
                unknown_callback: policy,
                ..SandboxSettings::default()
            },
        ))
    }

    fn app(machine: Option<Arc<SandboxMachine>>) -> Router {
        router(AppState {
            registry: Arc::new(PluginRegistry::new()),
            machine,
        })
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn callback_request(query: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/plugins/test-runner/callback?{query}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app(None).oneshot(get_request("/health")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plugin_listing_reports_every_kind() {
        let response = app(None)
            .oneshot(get_request("/api/v1/plugins"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let plugins = body.as_array().expect("array");
        assert_eq!(plugins.len(), 4);
        assert_eq!(plugins[0]["id"], "ai");
        assert_eq!(plugins[1]["id"], "test-runner");
        // Nothing is registered, so nothing is usable.
        assert!(plugins.iter().all(|p| p["enabled"] == false));
    }

    #[tokio::test]
    async fn categories_are_listed() {
        let response = app(None)
            .oneshot(get_request("/api/v1/plugins/categories"))
            .await
            .expect("response");
        let body = json_body(response).await;
        let ids: Vec<&str> = body
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|c| c["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["general", "ai", "code"]);
    }

    #[tokio::test]
    async fn callback_without_sandbox_is_not_found() {
        let response = app(None)
            .oneshot(callback_request("type=run&id=a1", "[]"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn callback_with_bad_type_is_rejected() {
        let response = app(Some(machine(UnknownCallbackPolicy::Drop)))
            .oneshot(callback_request("type=compile&id=a1", "[]"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn anonymous_unknown_callback_follows_policy() {
        let dropped = app(Some(machine(UnknownCallbackPolicy::Drop)))
            .oneshot(callback_request("type=run&id=nobody", "[]"))
            .await
            .expect("response");
        assert_eq!(dropped.status(), StatusCode::OK);
        assert_eq!(json_body(dropped).await["status"], "dropped");

        let rejected = app(Some(machine(UnknownCallbackPolicy::Reject)))
            .oneshot(callback_request("type=run&id=nobody&assessment=&criterion=", "[]"))
            .await
            .expect("response");
        assert_eq!(rejected.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_callback_completes_a_started_attempt() {
        let machine = machine(UnknownCallbackPolicy::Drop);
        let config: TestRunnerConfig = parse_config(
            r#"{"type":"test-runner","runCommand":"python3 main.py","testCases":[{"input":"","output":"hi\n"}]}"#,
        )
        .expect("config");
        machine
            .start(StartAttempt {
                attempt_id: "att-http".to_string(),
                assessment_id: "A1".to_string(),
                criterion: Criterion {
                    criterion_name: "Says hi".to_string(),
                    file_refs: vec!["g/s/main.py".to_string()],
                    levels: vec![],
                    plugin: "test-runner".to_string(),
                    configuration: String::new(),
                },
                config,
                files: [("main.py".to_string(), "print('hi')".to_string())].into(),
            })
            .await
            .expect("start");

        let response = app(Some(Arc::clone(&machine)))
            .oneshot(callback_request(
                "type=run&id=att-http&assessment=A1&criterion=Says%20hi",
                r#"[{"status":"Accepted","exitStatus":0,"time":1,"memory":1,"runTime":1,"files":{"stdout":"hi\n","stderr":""}}]"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "completed");
        let record = machine.state("att-http").await.expect("state").expect("record");
        assert_eq!(record.step, SandboxStep::Aggregated);
    }
}
