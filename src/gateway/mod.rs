//! OpenAI-compatible gateway in front of a single-message query backend.

pub mod backend;
pub mod config;
pub mod credentials;
pub mod http;
pub mod observability;
pub mod orchestrator;
#[cfg(feature = "gateway-otel")]
pub mod otel;
pub mod translation;

use serde_json::Value;
use thiserror::Error;

pub use backend::{HttpSageBackend, SageBackend};
pub use config::{ApiKeyEntry, GatewayConfig, QueryDefaults, resolve_credentials};
pub use credentials::{
    Credential, CredentialPool, CredentialPreview, Entropy, PoolStats, SelectionStrategy,
    SystemEntropy, TierStats,
};
pub use http::{GatewayHttpState, router};
pub use observability::{ErrorCounts, Observability, ObservabilitySnapshot};
pub use orchestrator::{ChatGateway, ChatOutcome, ChatStream, RequestState};
pub use translation::{BackendAnswer, QueryPayload};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String, timed_out: bool },
    #[error("backend rejected request ({status}): {body}")]
    BackendRejected { status: u16, body: String },
    #[error("malformed backend response")]
    MalformedBackendResponse { raw: Value },
}

impl GatewayError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::InvalidConfiguration { .. } => "invalid_configuration",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::BackendRejected { .. } => "backend_rejected",
            GatewayError::MalformedBackendResponse { .. } => "malformed_backend_response",
        }
    }
}
