use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{
    ApiKeyEntry, ChatGateway, ChatOutcome, GatewayError, ObservabilitySnapshot, PoolStats,
    resolve_credentials,
};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const REQUEST_ID_HEADER: &str = "x-request-id";
const RESPONSE_REQUEST_ID_HEADER: &str = "x-sage-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;
const ACCESS_LOG_TARGET: &str = "sage_gateway::access";

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: ChatGateway,
    admin_token: Option<String>,
}

impl std::fmt::Debug for GatewayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHttpState")
            .field("gateway", &self.gateway)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GatewayHttpState {
    pub fn new(gateway: ChatGateway) -> Self {
        Self {
            gateway,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }

    pub fn gateway(&self) -> &ChatGateway {
        &self.gateway
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    let mut router = Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", axum::routing::post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .fallback(handle_fallback);

    if state.admin_token.is_some() {
        router = router.route("/admin/keys", get(list_keys).put(replace_keys));
    }

    router.with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct BannerResponse {
    service: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
}

async fn banner(State(state): State<GatewayHttpState>) -> Json<BannerResponse> {
    let mut endpoints = vec![
        "GET /health",
        "GET /metrics",
        "POST /v1/chat/completions",
        "GET /v1/models",
    ];
    if state.admin_token.is_some() {
        endpoints.extend(["GET /admin/keys", "PUT /admin/keys"]);
    }
    Json(BannerResponse {
        service: "sage-gateway",
        version: env!("CARGO_PKG_VERSION"),
        endpoints,
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability().snapshot())
}

async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from_headers(&headers);
    let span = tracing::info_span!("http_request", request_id = %request_id, route = "chat_completions");

    async {
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            event = "chat.request",
            body_bytes = body.len(),
            "chat request received"
        );

        let mut response = match state.gateway.chat_completions(&body, &request_id).await {
            Ok(ChatOutcome::Completion(completion)) => {
                tracing::info!(
                    target: ACCESS_LOG_TARGET,
                    event = "chat.completed",
                    stream = false,
                    "chat request completed"
                );
                (StatusCode::OK, Json(completion)).into_response()
            }
            Ok(ChatOutcome::Stream(stream)) => {
                tracing::info!(
                    target: ACCESS_LOG_TARGET,
                    event = "chat.completed",
                    stream = true,
                    "chat request completed"
                );
                let mut response = Response::new(Body::from_stream(stream));
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response
            }
            Err(err) => {
                tracing::info!(
                    target: ACCESS_LOG_TARGET,
                    event = "chat.error",
                    kind = err.kind(),
                    "chat request failed"
                );
                map_gateway_error(&err).into_response()
            }
        };
        insert_request_id(response.headers_mut(), &request_id);
        response
    }
    .instrument(span)
    .await
}

async fn handle_models(State(state): State<GatewayHttpState>, headers: HeaderMap) -> Response {
    let request_id = request_id_from_headers(&headers);
    let mut response = match state.gateway.list_models().await {
        Ok(models) => (StatusCode::OK, Json(models)).into_response(),
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "model listing failed");
            map_gateway_error(&err).into_response()
        }
    };
    insert_request_id(response.headers_mut(), &request_id);
    response
}

/// Body accepted by `PUT /admin/keys`: the same list `api_keys` takes in the
/// config file, bare or wrapped.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplaceKeysRequest {
    List(Vec<ApiKeyEntry>),
    Wrapped { api_keys: Vec<ApiKeyEntry> },
}

async fn list_keys(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<PoolStats>, (StatusCode, Json<OpenAiErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    Ok(Json(state.gateway.pool().stats()))
}

async fn replace_keys(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PoolStats>, (StatusCode, Json<OpenAiErrorResponse>)> {
    ensure_admin(&state, &headers)?;

    let request: ReplaceKeysRequest = serde_json::from_slice(&body).map_err(|err| {
        map_gateway_error(&GatewayError::invalid_request(format!(
            "invalid key list: {err}"
        )))
    })?;
    let entries = match request {
        ReplaceKeysRequest::List(entries) | ReplaceKeysRequest::Wrapped { api_keys: entries } => {
            entries
        }
    };

    let pool = state.gateway.pool();
    resolve_credentials(&entries)
        .and_then(|credentials| pool.replace(credentials))
        .map_err(|err| {
            tracing::warn!(error = %err, "rejected key replacement");
            map_gateway_error(&err)
        })?;

    tracing::info!(
        target: ACCESS_LOG_TARGET,
        event = "admin.keys_replaced",
        count = pool.len(),
        "credential pool replaced"
    );
    Ok(Json(pool.stats()))
}

fn ensure_admin(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<OpenAiErrorResponse>)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(openai_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            Some("not_configured"),
            "admin auth not configured",
        ));
    };

    let provided = extract_header(headers, "x-admin-token")
        .or_else(|| extract_bearer(headers))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(openai_error(
        StatusCode::UNAUTHORIZED,
        "authentication_error",
        Some("unauthorized"),
        "invalid admin token",
    ))
}

async fn handle_fallback(req: axum::http::Request<Body>) -> Response {
    openai_error(
        StatusCode::NOT_FOUND,
        "invalid_request_error",
        Some("not_found"),
        format!("unknown route: {} {}", req.method(), req.uri().path()),
    )
    .into_response()
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
}

fn map_gateway_error(err: &GatewayError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    match err {
        GatewayError::InvalidRequest { .. } => openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("invalid_request"),
            err,
        ),
        GatewayError::InvalidConfiguration { .. } => openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("invalid_configuration"),
            err,
        ),
        GatewayError::BackendUnavailable { timed_out: true, .. } => openai_error(
            StatusCode::GATEWAY_TIMEOUT,
            "api_error",
            Some("backend_timeout"),
            err,
        ),
        GatewayError::BackendUnavailable { .. } => openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "api_error",
            Some("backend_unavailable"),
            err,
        ),
        GatewayError::BackendRejected { status, .. } if matches!(*status, 401 | 403) => {
            openai_error(
                StatusCode::BAD_GATEWAY,
                "api_error",
                Some("backend_auth_failed"),
                format!("backend rejected the gateway credential ({status})"),
            )
        }
        GatewayError::BackendRejected { status, .. } => {
            let status = StatusCode::from_u16(*status)
                .ok()
                .filter(|status| status.is_client_error() || status.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let kind = if status.is_client_error() {
                "invalid_request_error"
            } else {
                "api_error"
            };
            openai_error(status, kind, Some("backend_rejected"), err)
        }
        GatewayError::MalformedBackendResponse { .. } => openai_error(
            StatusCode::BAD_GATEWAY,
            "api_error",
            Some("malformed_backend_response"),
            "backend returned a response the gateway could not interpret",
        ),
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    extract_header(headers, REQUEST_ID_HEADER)
        .filter(|id| id.len() <= MAX_REQUEST_ID_LEN)
        .filter(|id| {
            id.chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        })
        .unwrap_or_else(generate_request_id)
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("sage-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let Ok(value) = HeaderValue::from_str(request_id) else {
        return;
    };
    headers.insert(RESPONSE_REQUEST_ID_HEADER, value);
}
