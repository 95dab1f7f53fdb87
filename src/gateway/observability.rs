use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::GatewayError;
use super::orchestrator::RequestState;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub streamed: u64,
    pub backend_calls: u64,
    pub completed: u64,
    pub errors: ErrorCounts,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub invalid_request: u64,
    pub invalid_configuration: u64,
    pub backend_unavailable: u64,
    pub backend_rejected: u64,
    pub malformed_backend_response: u64,
}

/// Request counters shared by every in-flight request. Updated from the
/// orchestrator's state transitions.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    streamed: AtomicU64,
    backend_calls: AtomicU64,
    completed: AtomicU64,
    invalid_request: AtomicU64,
    invalid_configuration: AtomicU64,
    backend_unavailable: AtomicU64,
    backend_rejected: AtomicU64,
    malformed_backend_response: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_transition(&self, state: RequestState) {
        match state {
            RequestState::Received => bump(&self.requests),
            RequestState::BackendCalled => bump(&self.backend_calls),
            RequestState::Sent => bump(&self.completed),
            RequestState::Translating
            | RequestState::CredentialSelected
            | RequestState::Translated
            | RequestState::Errored => {}
        }
    }

    pub fn record_stream(&self) {
        bump(&self.streamed);
    }

    pub fn record_error(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::InvalidRequest { .. } => &self.invalid_request,
            GatewayError::InvalidConfiguration { .. } => &self.invalid_configuration,
            GatewayError::BackendUnavailable { .. } => &self.backend_unavailable,
            GatewayError::BackendRejected { .. } => &self.backend_rejected,
            GatewayError::MalformedBackendResponse { .. } => &self.malformed_backend_response,
        };
        bump(counter);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            streamed: load(&self.streamed),
            backend_calls: load(&self.backend_calls),
            completed: load(&self.completed),
            errors: ErrorCounts {
                invalid_request: load(&self.invalid_request),
                invalid_configuration: load(&self.invalid_configuration),
                backend_unavailable: load(&self.backend_unavailable),
                backend_rejected: load(&self.backend_rejected),
                malformed_backend_response: load(&self.malformed_backend_response),
            },
        }
    }
}
