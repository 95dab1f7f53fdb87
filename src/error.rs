use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum SageError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "gateway-config-yaml")]
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SageError>;
