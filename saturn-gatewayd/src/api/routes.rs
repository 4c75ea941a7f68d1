use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use shared::openai::{ChatCompletionRequest, HealthResponse, ModelsResponse};
use shared::protocol::{CHAT_COMPLETIONS_PATH, HEALTH_PATH, MODELS_PATH};
use shared::types::ServiceRecord;
use crate::registry_manager::RegistryHandle;
use crate::router::{ModelRouter, RouteError, RouteResponse, SseRelay};

const PROVIDER: &str = "Saturn gateway";

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub router: ModelRouter,
    pub max_retries: usize,
}

/// Error returned to callers as `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        let status = match e {
            RouteError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            RouteError::AllFailed { .. } => StatusCode::BAD_GATEWAY,
            RouteError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(MODELS_PATH, get(list_models))
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:name", get(get_service))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let services = state.registry.snapshot().await;
    let healthy = services.iter().filter(|s| s.is_healthy).count();

    Json(HealthResponse {
        status: if healthy > 0 { "ok" } else { "no_services" }.to_string(),
        provider: PROVIDER.to_string(),
        services: healthy,
        total_services: services.len(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(state.router.models().await)
}

async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.model.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Field 'model' must be a non-empty string",
        ));
    }

    let model = request.model.clone();
    match state.router.route(&model, &request, state.max_retries).await? {
        RouteResponse::Json(body) => Ok(Json::<Value>(body).into_response()),
        RouteResponse::Stream(relay) => Ok(sse_response(relay)),
    }
}

fn sse_response(relay: SseRelay) -> Response {
    tracing::debug!("Opening event stream from {}", relay.service());
    let mut response = Response::new(Body::from_stream(relay.into_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn get_services(State(state): State<AppState>) -> Json<Vec<ServiceRecord>> {
    Json(state.registry.snapshot().await)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.registry.fingerprint()
}

async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceRecord>, ApiError> {
    state
        .registry
        .get(name.as_str())
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("Service '{}' not found", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;
    use crate::test_support::{backend_record, completion_body, spawn_backend};

    fn app(registry: &RegistryHandle) -> Router {
        let model_router = ModelRouter::with_timeouts(
            registry.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .unwrap();
        router(AppState {
            registry: registry.clone(),
            router: model_router,
            max_retries: 2,
        })
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let (status, _, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_chat(app: Router, body: Value) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let request = Request::post("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = RegistryHandle::spawn();

        let (status, body) = get_json(app(&registry), "/v1/models").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"models": []}));

        let (status, body) = get_json(app(&registry), "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"status": "no_services", "provider": "Saturn gateway", "services": 0, "total_services": 0})
        );
    }

    #[tokio::test]
    async fn test_health_counts_healthy_services() {
        let registry = RegistryHandle::spawn();
        let addr = "127.0.0.1:1".parse().unwrap();
        registry.upsert(backend_record("a", addr, 10, &["m1"])).await;
        let mut down = backend_record("b", addr, 20, &["m1"]);
        down.is_healthy = false;
        registry.upsert(down).await;

        let (_, body) = get_json(app(&registry), "/v1/health").await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["services"], 1);
        assert_eq!(body["total_services"], 2);
    }

    #[tokio::test]
    async fn test_models_aggregated_across_services() {
        let registry = RegistryHandle::spawn();
        let addr = "127.0.0.1:1".parse().unwrap();
        registry.upsert(backend_record("b", addr, 20, &["m1", "m2"])).await;
        registry.upsert(backend_record("a", addr, 10, &["m1"])).await;

        let (status, body) = get_json(app(&registry), "/v1/models").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"models": [
                {"id": "m1", "object": "model", "owned_by": "a", "services": ["a", "b"]},
                {"id": "m2", "object": "model", "owned_by": "b", "services": ["b"]},
            ]})
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_422() {
        let registry = RegistryHandle::spawn();
        let addr = "127.0.0.1:1".parse().unwrap();
        registry.upsert(backend_record("a", addr, 10, &["m1"])).await;

        let bad_bodies = [
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            json!({"model": "m1", "messages": [{"role": "robot", "content": "hi"}]}),
            json!({"model": "m1", "messages": [], "max_tokens": -1}),
            json!({"model": "", "messages": []}),
        ];
        for bad in bad_bodies {
            let (status, _, body) = post_chat(app(&registry), bad.clone()).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "body: {}", bad);
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert!(body["detail"].is_string());
        }
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let registry = RegistryHandle::spawn();

        let (status, _, body) = post_chat(
            app(&registry),
            json!({"model": "nope", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["detail"], "Model 'nope' not found in any available service");
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_502() {
        let registry = RegistryHandle::spawn();
        registry
            .upsert(backend_record("a", crate::test_support::closed_port_addr(), 10, &["m1"]))
            .await;

        let (status, _, body) = post_chat(
            app(&registry),
            json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["detail"].as_str().unwrap().starts_with("All services failed for model 'm1'"));
    }

    #[tokio::test]
    async fn test_forwards_validated_request_and_returns_backend_json() {
        let backend = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                // forwarded body is rebuilt, so unknown fields never reach the backend
                assert!(body.get("temperature").is_none());
                assert!(body.get("max_tokens").is_none());
                Json(completion_body("hello back"))
            }),
        );
        let addr = spawn_backend(backend).await;

        let registry = RegistryHandle::spawn();
        registry.upsert(backend_record("a", addr, 10, &["m1"])).await;

        let (status, _, body) = post_chat(
            app(&registry),
            json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}], "temperature": 0.2}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, completion_body("hello back"));
    }

    #[tokio::test]
    async fn test_streaming_response_frames_and_headers() {
        let backend = Router::new().route(
            "/v1/chat/completions",
            post(|| async { "data: {\"n\":1}\n\ndata: {\"n\":2}\n\n" }),
        );
        let addr = spawn_backend(backend).await;

        let registry = RegistryHandle::spawn();
        registry.upsert(backend_record("a", addr, 10, &["m1"])).await;

        let (status, headers, body) = post_chat(
            app(&registry),
            json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}], "stream": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn test_services_endpoints() {
        let registry = RegistryHandle::spawn();
        let addr = "127.0.0.1:9000".parse().unwrap();
        registry.upsert(backend_record("a", addr, 10, &["m1"])).await;

        let (status, body) = get_json(app(&registry), "/v1/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["name"], "a");
        assert_eq!(body[0]["port"], 9000);

        let (status, body) = get_json(app(&registry), "/v1/services/a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priority"], 10);

        let (status, _) = get_json(app(&registry), "/v1/services/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, hash) = send(
            app(&registry),
            Request::get("/v1/services/hash").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(hash).unwrap(), registry.fingerprint());
    }
}
