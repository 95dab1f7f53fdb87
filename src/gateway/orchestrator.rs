use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::backend::{HttpSageBackend, SageBackend};
use super::observability::Observability;
use super::translation::{self, BackendAnswer};
use super::{CredentialPool, GatewayConfig, GatewayError, QueryDefaults, SelectionStrategy};
use crate::types::ChatCompletionRequest;

pub type ChatStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Lifecycle of one chat request. `Sent` and `Errored` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Translating,
    CredentialSelected,
    BackendCalled,
    Translated,
    Sent,
    Errored,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::Translating => "translating",
            RequestState::CredentialSelected => "credential_selected",
            RequestState::BackendCalled => "backend_called",
            RequestState::Translated => "translated",
            RequestState::Sent => "sent",
            RequestState::Errored => "errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Sent | RequestState::Errored)
    }

    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Received, Translating)
            | (Translating, CredentialSelected)
            | (CredentialSelected, BackendCalled)
            | (BackendCalled, Translated)
            | (Translated, Sent) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

pub enum ChatOutcome {
    Completion(Value),
    Stream(ChatStream),
}

impl std::fmt::Debug for ChatOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatOutcome::Completion(value) => f.debug_tuple("Completion").field(value).finish(),
            ChatOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

struct RequestRun<'a> {
    request_id: &'a str,
    state: RequestState,
    observability: &'a Observability,
}

impl<'a> RequestRun<'a> {
    fn start(request_id: &'a str, observability: &'a Observability) -> Self {
        observability.record_transition(RequestState::Received);
        tracing::debug!(request_id, state = RequestState::Received.as_str(), "request state");
        Self {
            request_id,
            state: RequestState::Received,
            observability,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.observability.record_transition(next);
        tracing::debug!(
            request_id = self.request_id,
            state = next.as_str(),
            "request state"
        );
    }

    fn fail(&mut self, err: GatewayError) -> GatewayError {
        let from = self.state;
        self.state = RequestState::Errored;
        self.observability.record_transition(RequestState::Errored);
        self.observability.record_error(&err);
        match &err {
            GatewayError::MalformedBackendResponse { raw } => tracing::error!(
                request_id = self.request_id,
                from = from.as_str(),
                raw = %raw,
                "malformed backend response"
            ),
            GatewayError::InvalidRequest { .. } => tracing::debug!(
                request_id = self.request_id,
                from = from.as_str(),
                error = %err,
                "request rejected"
            ),
            _ => tracing::warn!(
                request_id = self.request_id,
                from = from.as_str(),
                error = %err,
                "request failed"
            ),
        }
        err
    }
}

/// Per-request glue between the credential pool, the translator and the
/// backend. Cheap to clone; every clone shares one pool.
#[derive(Clone)]
pub struct ChatGateway {
    pool: Arc<CredentialPool>,
    backend: Arc<dyn SageBackend>,
    strategy: SelectionStrategy,
    defaults: QueryDefaults,
    stream_chunk_chars: usize,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for ChatGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGateway")
            .field("pool", &self.pool)
            .field("strategy", &self.strategy)
            .field("defaults", &self.defaults)
            .field("stream_chunk_chars", &self.stream_chunk_chars)
            .finish_non_exhaustive()
    }
}

impl ChatGateway {
    pub fn new(pool: Arc<CredentialPool>, backend: Arc<dyn SageBackend>) -> Self {
        Self {
            pool,
            backend,
            strategy: SelectionStrategy::default(),
            defaults: QueryDefaults::default(),
            stream_chunk_chars: 0,
            observability: Arc::new(Observability::default()),
        }
    }

    /// Builds the pool and HTTP backend from a validated config. Fails if the
    /// key list cannot form a pool.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let pool = CredentialPool::new(config.credentials()?)?;
        let backend = HttpSageBackend::from_config(config)?;
        Ok(Self::new(Arc::new(pool), Arc::new(backend))
            .with_strategy(config.key_selection)
            .with_query_defaults(config.query_defaults.clone())
            .with_stream_chunk_chars(config.stream_chunk_chars))
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_query_defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_stream_chunk_chars(mut self, chars: usize) -> Self {
        self.stream_chunk_chars = chars;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Runs one raw `/v1/chat/completions` body through the request state
    /// machine.
    #[tracing::instrument(name = "chat_completion", skip_all, fields(request_id = %request_id))]
    pub async fn chat_completions(
        &self,
        body: &[u8],
        request_id: &str,
    ) -> Result<ChatOutcome, GatewayError> {
        let mut run = RequestRun::start(request_id, &self.observability);

        let request: ChatCompletionRequest = serde_json::from_slice(body)
            .map_err(|err| run.fail(GatewayError::invalid_request(format!("invalid json: {err}"))))?;
        self.run(run, request).await
    }

    pub async fn complete(
        &self,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChatOutcome, GatewayError> {
        let run = RequestRun::start(request_id, &self.observability);
        self.run(run, request).await
    }

    async fn run(
        &self,
        mut run: RequestRun<'_>,
        request: ChatCompletionRequest,
    ) -> Result<ChatOutcome, GatewayError> {
        run.advance(RequestState::Translating);
        let payload = translation::to_backend_payload(&request, &self.defaults)
            .map_err(|err| run.fail(err))?;
        let prompt_tokens = translation::estimate_tokens(&payload.message);

        let credential = self.pool.select(self.strategy);
        tracing::debug!(
            request_id = run.request_id,
            credential = credential.name(),
            strategy = self.strategy.as_str(),
            "credential selected"
        );
        run.advance(RequestState::CredentialSelected);

        let raw = self
            .backend
            .query(&credential, &payload)
            .await
            .map_err(|err| run.fail(err))?;
        run.advance(RequestState::BackendCalled);

        let answer: BackendAnswer =
            translation::normalize_answer(&raw).map_err(|err| run.fail(err))?;
        run.advance(RequestState::Translated);

        let id = format!("chatcmpl-{}", run.request_id);
        let created = unix_now_secs();
        let outcome = if request.is_stream() {
            self.observability.record_stream();
            let chunks = translation::chat_completion_chunks(
                &answer,
                &id,
                &request.model,
                created,
                prompt_tokens,
                self.stream_chunk_chars,
            );
            ChatOutcome::Stream(
                futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>))
                    .boxed(),
            )
        } else {
            ChatOutcome::Completion(translation::to_chat_completion(
                &answer,
                &id,
                &request.model,
                created,
                prompt_tokens,
            ))
        };
        run.advance(RequestState::Sent);
        Ok(outcome)
    }

    /// Lists backend models as an OpenAI model list. Uses the pool's primary
    /// credential so listings never advance the chat rotation.
    pub async fn list_models(&self) -> Result<Value, GatewayError> {
        let credential = self.pool.primary().ok_or_else(|| {
            GatewayError::InvalidConfiguration {
                reason: "credential pool is empty".to_string(),
            }
        })?;
        let raw = self.backend.list_models(&credential).await.map_err(|err| {
            self.observability.record_error(&err);
            err
        })?;
        translation::models_list_to_openai(&raw, unix_now_secs()).map_err(|err| {
            if let GatewayError::MalformedBackendResponse { raw } = &err {
                tracing::error!(raw = %raw, "malformed model list");
            }
            self.observability.record_error(&err);
            err
        })
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
