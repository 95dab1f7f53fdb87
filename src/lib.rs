mod error;

pub mod gateway;
pub mod types;
pub mod utils;

pub use error::{Result, SageError};

pub use gateway::{
    ApiKeyEntry, ChatGateway, ChatOutcome, Credential, CredentialPool, GatewayConfig,
    GatewayError, GatewayHttpState, HttpSageBackend, PoolStats, QueryDefaults, QueryPayload,
    RequestState, SageBackend, SelectionStrategy,
};
pub use types::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, Role};
