use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::translation::QueryPayload;
use super::{Credential, GatewayConfig, GatewayError};
use crate::utils::http::{response_bytes_limited, response_text_truncated};

const MAX_BACKEND_ERROR_BODY_BYTES: usize = 64 * 1024;
const MAX_BACKEND_RESPONSE_BYTES: usize = 16 * 1024 * 1024;
const ACCESS_TOKEN_HEADER: &str = "x-access-tokens";

/// Operations the gateway needs from the query backend. Each call is made
/// with exactly one credential chosen by the pool.
#[async_trait]
pub trait SageBackend: Send + Sync {
    async fn query(
        &self,
        credential: &Credential,
        payload: &QueryPayload,
    ) -> Result<Value, GatewayError>;

    async fn list_models(&self, credential: &Credential) -> Result<Value, GatewayError>;
}

#[derive(Clone)]
pub struct HttpSageBackend {
    server_base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl std::fmt::Debug for HttpSageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSageBackend")
            .field("server_base_url", &self.server_base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpSageBackend {
    pub fn with_client(
        server_base_url: impl Into<String>,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            server_base_url: server_base_url.into(),
            client,
            timeout,
        }
    }

    /// Builds the client from config, trusting `cert_path` in addition to the
    /// default roots when set.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let timeout = backend_timeout(config.timeout_seconds)?;
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(cert_path) = config.resolved_cert_path() {
            let pem = std::fs::read(&cert_path).map_err(|err| {
                GatewayError::InvalidConfiguration {
                    reason: format!("read cert_path {} failed: {err}", cert_path.display()),
                }
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                GatewayError::InvalidConfiguration {
                    reason: format!("invalid certificate {}: {err}", cert_path.display()),
                }
            })?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|err| GatewayError::InvalidConfiguration {
                reason: format!("backend http client error: {err}"),
            })?;
        Ok(Self::with_client(&config.server_base_url, client, timeout))
    }

    async fn post_json(
        &self,
        path: &str,
        credential: &Credential,
        body: &impl serde::Serialize,
    ) -> Result<Value, GatewayError> {
        let url = join_base_url(&self.server_base_url, path);
        let response = self
            .client
            .post(url)
            .header(ACCESS_TOKEN_HEADER, credential.secret())
            .json(body)
            .send()
            .await
            .map_err(|err| unavailable(err, self.timeout))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response_text_truncated(response, MAX_BACKEND_ERROR_BODY_BYTES).await;
            tracing::warn!(
                credential = %credential.name(),
                status = status.as_u16(),
                path,
                "backend rejected request"
            );
            return Err(GatewayError::BackendRejected {
                status: status.as_u16(),
                body,
            });
        }

        let (bytes, truncated) = response_bytes_limited(response, MAX_BACKEND_RESPONSE_BYTES)
            .await
            .map_err(|err| unavailable(err, self.timeout))?;
        if truncated {
            return Err(GatewayError::MalformedBackendResponse {
                raw: Value::String(format!(
                    "response exceeded max bytes ({MAX_BACKEND_RESPONSE_BYTES})"
                )),
            });
        }
        serde_json::from_slice::<Value>(&bytes).map_err(|_| {
            GatewayError::MalformedBackendResponse {
                raw: Value::String(String::from_utf8_lossy(&bytes).to_string()),
            }
        })
    }
}

#[async_trait]
impl SageBackend for HttpSageBackend {
    async fn query(
        &self,
        credential: &Credential,
        payload: &QueryPayload,
    ) -> Result<Value, GatewayError> {
        self.post_json("query", credential, payload).await
    }

    async fn list_models(&self, credential: &Credential) -> Result<Value, GatewayError> {
        self.post_json("get-models", credential, &serde_json::json!({}))
            .await
    }
}

fn unavailable(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::BackendUnavailable {
            message: format!("backend did not answer within {}s", timeout.as_secs_f64()),
            timed_out: true,
        };
    }
    GatewayError::BackendUnavailable {
        message: format!("backend request failed: {err}"),
        timed_out: false,
    }
}

fn backend_timeout(seconds: f64) -> Result<Duration, GatewayError> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|timeout| !timeout.is_zero())
        .ok_or_else(|| GatewayError::InvalidConfiguration {
            reason: format!("timeout_seconds {seconds} is not a usable duration"),
        })
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("{base}/{path}")
}
