use crate::assistant::{build_suggestions, collect_process_names, health_report, PrivacyLevel};
use crate::collectors::sampler::Sampler;
use crate::collectors::ProviderFactory;
use crate::commands::{execute_command, CommandError};
use crate::config::{CpuStabilityConfig, MonitorConfig};
use crate::generate::{Backend, Generator};
use crate::metrics::Metrics;
use crate::monitor::{DaemonState, TickReport};
use crate::scheduler::JobStatus;
use crate::state::State as DaemonStatus;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DaemonStatus>>,
    pub providers: ProviderFactory,
    pub generator: Arc<Generator>,
    pub monitor_cfg: MonitorConfig,
    pub cpu_stability: CpuStabilityConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiState {
    pub started_at: String,
    pub monitor: DaemonState,
    pub ticks: u64,
    pub tick_failures: u64,
    pub last_tick_at: Option<String>,
    pub last_tick_error: Option<String>,
    pub last_report: Option<TickReport>,
    pub jobs: Vec<JobStatus>,
}

impl From<&DaemonStatus> for ApiState {
    fn from(value: &DaemonStatus) -> Self {
        Self {
            started_at: rfc3339(value.started_at_unix),
            monitor: value.monitor,
            ticks: value.ticks,
            tick_failures: value.tick_failures,
            last_tick_at: value.last_tick_unix.map(rfc3339),
            last_tick_error: value.last_tick_error.clone(),
            last_report: value.last_report.clone(),
            jobs: value.jobs.clone(),
        }
    }
}

fn rfc3339(unix: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}

pub fn build_router(app: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/suggest", get(suggest_handler))
        .route("/api/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/command", post(command_handler))
        .with_state(app)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from(&*guard))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Runs `work` against a sampler of its own so ad-hoc requests never touch
/// the monitor loop's network counters.
async fn with_fresh_sampler<T, F>(state: &HttpAppState, work: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&mut Sampler) -> T + Send + 'static,
{
    let mut sampler = Sampler::new(
        (state.providers)(),
        state.monitor_cfg.resolved_disk_path(),
    );
    tokio::task::spawn_blocking(move || work(&mut sampler))
        .await
        .map_err(|err| {
            error!(error = %err, "ad-hoc sampling task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "sampling failed")
        })
}

#[derive(Debug, Deserialize)]
struct SuggestQuery {
    privacy: Option<String>,
}

async fn suggest_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<SuggestQuery>,
) -> Response {
    let privacy = PrivacyLevel::from_query(query.privacy.as_deref());
    let result = with_fresh_sampler(&state, move |sampler| {
        let reading = sampler.sample();
        let names = if privacy.allows_context() {
            collect_process_names(sampler.provider_mut())
        } else {
            Vec::new()
        };
        build_suggestions(&reading.snapshot, privacy, &names)
    })
    .await;

    match result {
        Ok(suggestions) => Json(suggestions).into_response(),
        Err(resp) => resp,
    }
}

async fn health_handler(State(state): State<HttpAppState>) -> Response {
    let result = with_fresh_sampler(&state, |sampler| {
        let reading = sampler.sample();
        let listening = sampler.connection_report().ok().map(|r| r.listening);
        health_report(&reading.snapshot, listening)
    })
    .await;

    match result {
        Ok(report) => Json(report).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    prompt: String,
    max_tokens: Option<u32>,
    backend: Option<String>,
    #[serde(default)]
    force_mock: bool,
}

async fn generate_handler(
    State(state): State<HttpAppState>,
    Json(req): Json<GenerateRequest>,
) -> Response {
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt is required");
    }
    let backend = match req.backend.as_deref().map(str::parse::<Backend>).transpose() {
        Ok(backend) => backend,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let max_tokens = req
        .max_tokens
        .unwrap_or_else(|| state.generator.default_max_tokens());

    match state
        .generator
        .generate(&req.prompt, max_tokens, backend, req.force_mock)
        .await
    {
        Ok(text) => Json(json!({ "text": text })).into_response(),
        Err(err) => {
            warn!(error = %err, "text generation failed");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    text: String,
}

async fn command_handler(
    State(state): State<HttpAppState>,
    Json(req): Json<CommandRequest>,
) -> Response {
    let cfg = state.cpu_stability.clone();
    let result = with_fresh_sampler(&state, move |sampler| {
        execute_command(&req.text, sampler.provider_mut(), &cfg)
    })
    .await;

    match result {
        Ok(Ok(outcome)) => Json(outcome).into_response(),
        Ok(Err(CommandError::Empty)) => {
            error_response(StatusCode::BAD_REQUEST, CommandError::Empty.to_string())
        }
        Err(resp) => resp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::FakeProvider;
    use crate::collectors::SystemProvider;
    use crate::config::LlmConfig;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_with(provider: FakeProvider) -> (Router, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics init");
        let state = Arc::new(RwLock::new(DaemonStatus::new(0)));
        let providers: ProviderFactory =
            Arc::new(move || Box::new(provider.clone()) as Box<dyn SystemProvider>);
        let app = build_router(HttpAppState {
            metrics: metrics.clone(),
            state,
            providers,
            generator: Arc::new(Generator::new(LlmConfig::default())),
            monitor_cfg: MonitorConfig {
                disk_path: Some("/".into()),
                ..MonitorConfig::default()
            },
            cpu_stability: CpuStabilityConfig {
                samples: 3,
                spacing_ms: 0,
                variance_threshold: 100.0,
            },
        });
        (app, metrics)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app_with(FakeProvider::healthy());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_counts_scrapes() {
        let (app, metrics) = app_with(FakeProvider::healthy());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("osaid_uptime_seconds"));
        assert_eq!(metrics.osaid_scrape_count_total.get(), 1.0);
    }

    #[tokio::test]
    async fn api_state_reports_stopped_monitor() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) = get_json(app, "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["monitor"], "stopped");
        assert_eq!(body["started_at"], "1970-01-01T00:00:00Z");
        assert!(body["last_report"].is_null());
    }

    #[tokio::test]
    async fn suggest_defaults_to_balanced_and_includes_context() {
        let mut provider = FakeProvider::healthy();
        provider.cpu = Some(2.0);
        provider.names.insert(1, "bash".to_string());
        let (app, _) = app_with(provider);
        let (status, body) = get_json(app, "/api/suggest").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["privacy"], "balanced");
        assert_eq!(body["context"], "idle");
        assert_eq!(
            body["suggestions"],
            json!(["Idle detected: good time to run cleanup, backups, and updates."])
        );
    }

    #[tokio::test]
    async fn suggest_strict_omits_context() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) = get_json(app, "/api/suggest?privacy=strict").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["privacy"], "strict");
        assert!(body.get("context").is_none());
    }

    #[tokio::test]
    async fn health_survives_socket_failure() {
        let mut provider = FakeProvider::healthy();
        provider.connections = None;
        provider.disk = Some(95.0);
        let (app, _) = app_with(provider);
        let (status, body) = get_json(app, "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["anomaly_score"], 0.0);
        assert_eq!(body["maintenance"].as_array().unwrap().len(), 1);
        assert!(body["maintenance"][0]
            .as_str()
            .unwrap()
            .starts_with("Disk failure risk"));
    }

    #[tokio::test]
    async fn generate_requires_prompt() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) = post_json(app, "/api/generate", json!({ "prompt": "  " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "prompt is required");
    }

    #[tokio::test]
    async fn generate_uses_mock_backend() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) = post_json(
            app,
            "/api/generate",
            json!({ "prompt": "Say hello", "max_tokens": 5, "backend": "mock" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["text"],
            "[mock-lm] Generated (max_tokens=5): Hello! (echo) Say hello"
        );
    }

    #[tokio::test]
    async fn generate_backend_failure_is_bad_gateway() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) = post_json(
            app,
            "/api/generate",
            json!({ "prompt": "hi", "backend": "remote" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("REMOTE_API_URL"));
    }

    #[tokio::test]
    async fn command_endpoint_runs_stability_check() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) =
            post_json(app, "/api/command", json!({ "text": "check cpu stability" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intent"], "cpu_stability");
        assert_eq!(body["samples"].as_array().unwrap().len(), 3);
        assert_eq!(body["stable"], true);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let (app, _) = app_with(FakeProvider::healthy());
        let (status, body) = post_json(app, "/api/command", json!({ "text": "" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "empty command");
    }
}
