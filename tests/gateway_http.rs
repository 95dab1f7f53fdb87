use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use sage_gateway::gateway::{ApiKeyEntry, ChatGateway, GatewayConfig, GatewayHttpState, http};
use sage_gateway::utils::test_support::should_skip_httpmock;
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn config_for(base_url: String) -> GatewayConfig {
    let mut config = GatewayConfig::with_api_keys(vec![
        ApiKeyEntry::Key("sk-one".to_string()),
        ApiKeyEntry::Key("sk-two".to_string()),
    ]);
    config.server_base_url = base_url;
    config.timeout_seconds = 5.0;
    config
}

fn app(config: &GatewayConfig, admin_token: Option<&str>) -> Router {
    let gateway = ChatGateway::from_config(config).expect("gateway");
    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }
    http::router(state)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Backend that answers 200 with a truncated body, then either holds the
/// socket open for `hold` or closes it.
fn partial_body_backend(hold: Option<Duration>) -> String {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let Ok((mut socket, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 16 * 1024];
        let _ = socket.read(&mut buf);
        let _ = socket.write_all(
            b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"response\":\"par",
        );
        let _ = socket.flush();
        if let Some(hold) = hold {
            std::thread::sleep(hold);
        }
    });
    format!("http://{addr}")
}

fn simple_chat() -> Value {
    json!({"model": "gpt-4", "messages": [{"role": "user", "content": "2+2?"}]})
}

#[tokio::test]
async fn gateway_http_chat_completion_round_trip() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/query")
            .header("x-access-tokens", "sk-one")
            .body_includes("\"message\":\"2+2?\"")
            .body_includes("\"persona\":\"default\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"response":"4","status":200}"#);
    });

    let app = app(&config_for(upstream.base_url()), None);
    let mut request = chat_request(simple_chat());
    request
        .headers_mut()
        .insert("x-request-id", "trace-42".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-sage-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("trace-42")
    );
    let body = body_json(response).await;
    assert_eq!(body["id"], "chatcmpl-trace-42");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "4");
    assert_eq!(body["usage"]["completion_tokens"], 1);
    mock.assert_calls(1);
}

#[tokio::test]
async fn gateway_http_rotates_keys_across_requests() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let first = upstream.mock(|when, then| {
        when.method(POST)
            .path("/query")
            .header("x-access-tokens", "sk-one");
        then.status(200).body(r#"{"response":"one"}"#);
    });
    let second = upstream.mock(|when, then| {
        when.method(POST)
            .path("/query")
            .header("x-access-tokens", "sk-two");
        then.status(200).body(r#"{"response":"two"}"#);
    });

    let app = app(&config_for(upstream.base_url()), None);
    for _ in 0..4 {
        let response = app.clone().oneshot(chat_request(simple_chat())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    first.assert_calls(2);
    second.assert_calls(2);
}

#[tokio::test]
async fn gateway_http_streams_synthesized_chunks() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(200).body(
            r#"{"response":{"response":"Paris","message":"m","uuid":"u-1","references":"","status":200},"status":200}"#,
        );
    });

    let app = app(&config_for(upstream.base_url()), None);
    let mut body = simple_chat();
    body["stream"] = json!(true);
    let response = app.oneshot(chat_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let text = body_text(response).await;
    assert!(text.ends_with("data: [DONE]\n\n"));

    let chunks: Vec<Value> = text
        .split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let joined: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(joined, "Paris");
    assert_eq!(
        chunks.last().unwrap()["choices"][0]["finish_reason"],
        "stop"
    );
}

#[tokio::test]
async fn gateway_http_invalid_json_is_rejected_before_backend() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(200).body(r#"{"response":"unused"}"#);
    });

    let app = app(&config_for(upstream.base_url()), None);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from("{broken"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(body["error"]["message"].as_str().is_some());
    mock.assert_calls(0);
}

#[tokio::test]
async fn gateway_http_forwards_backend_rejections() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(429).body("quota exhausted");
    });

    let app = app(&config_for(upstream.base_url()), None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "backend_rejected");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("quota exhausted")
    );
}

#[tokio::test]
async fn gateway_http_backend_auth_failure_is_bad_gateway() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(401).body("invalid token sk-one");
    });

    let app = app(&config_for(upstream.base_url()), None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let text = body_text(response).await;
    assert!(!text.contains("sk-one"));
}

#[tokio::test]
async fn gateway_http_malformed_backend_reply_is_hidden() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(200).body(r#"{"status":200,"internal":"do-not-leak"}"#);
    });

    let app = app(&config_for(upstream.base_url()), None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "malformed_backend_response");
    assert!(!body.to_string().contains("do-not-leak"));
}

#[tokio::test]
async fn gateway_http_backend_timeout_maps_to_gateway_timeout() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(200)
            .delay(Duration::from_millis(1_500))
            .body(r#"{"response":"late"}"#);
    });

    let mut config = config_for(upstream.base_url());
    config.timeout_seconds = 0.2;
    let app = app(&config, None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "backend_timeout");
}

#[tokio::test]
async fn gateway_http_stalled_backend_body_is_a_timeout() {
    if should_skip_httpmock() {
        return;
    }

    let mut config = config_for(partial_body_backend(Some(Duration::from_secs(3))));
    config.timeout_seconds = 0.3;
    let app = app(&config, None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "backend_timeout");
}

#[tokio::test]
async fn gateway_http_backend_dropping_mid_body_is_unavailable() {
    if should_skip_httpmock() {
        return;
    }

    let app = app(&config_for(partial_body_backend(None)), None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "backend_unavailable");
}

#[tokio::test]
async fn gateway_http_non_ok_success_status_is_rejected() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/query");
        then.status(201).body(r#"{"response":"4","status":201}"#);
    });

    let app = app(&config_for(upstream.base_url()), None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "backend_rejected");
}

#[tokio::test]
async fn gateway_http_unreachable_backend_is_unavailable() {
    if should_skip_httpmock() {
        return;
    }

    let port = {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    };
    let app = app(&config_for(format!("http://127.0.0.1:{port}")), None);
    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "backend_unavailable");
}

#[tokio::test]
async fn gateway_http_lists_backend_models() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/get-models")
            .header("x-access-tokens", "sk-one");
        then.status(200)
            .body(r#"{"response":["gpt-4o","claude-35-sonnet"],"status":200}"#);
    });

    let app = app(&config_for(upstream.base_url()), None);
    let response = app.oneshot(get("/v1/models")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "claude-35-sonnet"]);
    mock.assert_calls(1);
}

#[tokio::test]
async fn gateway_http_health_banner_metrics_and_fallback() {
    let app = app(&config_for("http://127.0.0.1:9".to_string()), None);

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = app.clone().oneshot(get("/")).await.unwrap();
    let banner = body_json(response).await;
    assert_eq!(banner["service"], "sage-gateway");
    assert!(
        !banner["endpoints"]
            .as_array()
            .unwrap()
            .iter()
            .any(|endpoint| endpoint.as_str().unwrap_or_default().contains("admin"))
    );

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(body_json(response).await["requests"], 0);

    let response = app.clone().oneshot(get("/v1/embeddings")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "not_found");

    let response = app.oneshot(get("/admin/keys")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn gateway_http_admin_keys_require_token() {
    let app = app(&config_for("http://127.0.0.1:9".to_string()), Some("admin-secret"));

    let response = app.clone().oneshot(get("/admin/keys")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/admin/keys")
        .header("authorization", "Bearer admin-secret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["count"], 2);
    assert_eq!(stats["keys"][0]["name"], "key_1");
    assert!(!stats.to_string().contains("sk-one"));
}

#[tokio::test]
async fn gateway_http_admin_replace_swaps_pool() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let replaced = upstream.mock(|when, then| {
        when.method(POST)
            .path("/query")
            .header("x-access-tokens", "sk-fresh");
        then.status(200).body(r#"{"response":"fresh"}"#);
    });

    let app = app(&config_for(upstream.base_url()), Some("admin-secret"));

    let rejected = Request::builder()
        .method("PUT")
        .uri("/admin/keys")
        .header("x-admin-token", "admin-secret")
        .body(Body::from("[]"))
        .unwrap();
    let response = app.clone().oneshot(rejected).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "invalid_configuration");

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/keys")
        .header("x-admin-token", "admin-secret")
        .body(Body::from(
            json!({"api_keys": [{"key": "sk-fresh", "weight": 3.0, "name": "fresh"}]}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["count"], 1);
    assert_eq!(stats["total_weight"], 3.0);

    let response = app.oneshot(chat_request(simple_chat())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    replaced.assert_calls(1);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn gateway_http_access_events_go_through_tracing() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    // Invalid JSON is rejected before any backend call.
    let app = app(&config_for("http://127.0.0.1:9".to_string()), None);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-request-id", "trace-log")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let raw = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let records: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("every log line is one JSON record"))
        .collect();
    let access: Vec<&Value> = records
        .iter()
        .filter(|record| record["target"] == "sage_gateway::access")
        .collect();
    let events: Vec<&str> = access
        .iter()
        .filter_map(|record| record["fields"]["event"].as_str())
        .collect();
    assert_eq!(events, vec!["chat.request", "chat.error"]);
    assert!(
        access
            .iter()
            .all(|record| record["span"]["request_id"] == "trace-log")
    );
    assert_eq!(access[1]["fields"]["kind"], "invalid_request");
}
