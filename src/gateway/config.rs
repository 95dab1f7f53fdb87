use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Credential, GatewayError, SelectionStrategy};
use crate::SageError;

pub const DEFAULT_SERVER_BASE_URL: &str = "https://api.asksage.anl.gov/server";
pub const DEFAULT_USER_BASE_URL: &str = "https://api.asksage.anl.gov/user";

const ENV_HOST: &str = "SAGE_GATEWAY_HOST";
const ENV_PORT: &str = "SAGE_GATEWAY_PORT";
const ENV_VERBOSE: &str = "SAGE_GATEWAY_VERBOSE";

/// One `api_keys` entry: either a bare secret or an object with an optional
/// weight and display name.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiKeyEntry {
    Key(String),
    Detailed {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl std::fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiKeyEntry::Key(_) => f.debug_tuple("Key").field(&"<redacted>").finish(),
            ApiKeyEntry::Detailed { weight, name, .. } => f
                .debug_struct("Detailed")
                .field("key", &"<redacted>")
                .field("weight", weight)
                .field("name", name)
                .finish(),
        }
    }
}

impl ApiKeyEntry {
    pub fn weighted(key: impl Into<String>, weight: f64, name: Option<&str>) -> Self {
        Self::Detailed {
            key: key.into(),
            weight: Some(weight),
            name: name.map(str::to_string),
        }
    }

    fn resolve(&self, position: usize) -> Result<Credential, GatewayError> {
        let default_name = || format!("key_{position}");
        let (key, weight, name) = match self {
            ApiKeyEntry::Key(key) => (key.as_str(), 1.0, default_name()),
            ApiKeyEntry::Detailed { key, weight, name } => {
                let name = name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(default_name);
                (key.as_str(), weight.unwrap_or(1.0), name)
            }
        };

        if key.trim().is_empty() {
            return Err(GatewayError::InvalidConfiguration {
                reason: format!("API key #{position} is empty"),
            });
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(GatewayError::InvalidConfiguration {
                reason: format!("API key #{position} weight must be a positive number"),
            });
        }
        Ok(Credential::new(position, name, key, weight))
    }
}

/// Resolves config entries into credentials, numbering them from 1.
pub fn resolve_credentials(entries: &[ApiKeyEntry]) -> Result<Vec<Credential>, GatewayError> {
    if entries.is_empty() {
        return Err(GatewayError::InvalidConfiguration {
            reason: "at least one API key is required in api_keys".to_string(),
        });
    }

    let mut out = Vec::<Credential>::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let credential = entry.resolve(idx + 1)?;
        if out.iter().any(|other| other.name() == credential.name()) {
            return Err(GatewayError::InvalidConfiguration {
                reason: format!("duplicate API key name: {}", credential.name()),
            });
        }
        out.push(credential);
    }
    Ok(out)
}

/// Backend query fields the gateway fills in when a request leaves them out.
///
/// `persona` and `dataset` are opaque to the gateway. A nonzero `live`
/// enables backend live retrieval; `limit_references` caps retrieved
/// reference snippets, with 0 meaning the backend default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryDefaults {
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub live: u32,
    #[serde(default)]
    pub limit_references: u32,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            persona: default_persona(),
            dataset: default_dataset(),
            live: 0,
            limit_references: 0,
        }
    }
}

fn default_persona() -> String {
    "default".to_string()
}

fn default_dataset() -> String {
    "all".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
    #[serde(default)]
    pub key_selection: SelectionStrategy,
    #[serde(default = "default_server_base_url")]
    pub server_base_url: String,
    #[serde(default = "default_user_base_url")]
    pub user_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub query_defaults: QueryDefaults,
    #[serde(default)]
    pub stream_chunk_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("verbose", &self.verbose)
            .field("api_keys", &self.api_keys)
            .field("key_selection", &self.key_selection)
            .field("server_base_url", &self.server_base_url)
            .field("user_base_url", &self.user_base_url)
            .field("cert_path", &self.cert_path)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("query_defaults", &self.query_defaults)
            .field("stream_chunk_chars", &self.stream_chunk_chars)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_server_base_url() -> String {
    DEFAULT_SERVER_BASE_URL.to_string()
}

fn default_user_base_url() -> String {
    DEFAULT_USER_BASE_URL.to_string()
}

fn default_timeout_seconds() -> f64 {
    30.0
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verbose: true,
            api_keys: Vec::new(),
            key_selection: SelectionStrategy::default(),
            server_base_url: default_server_base_url(),
            user_base_url: default_user_base_url(),
            cert_path: None,
            timeout_seconds: default_timeout_seconds(),
            query_defaults: QueryDefaults::default(),
            stream_chunk_chars: 0,
            admin_token: None,
        }
    }
}

impl GatewayConfig {
    pub fn with_api_keys(api_keys: Vec<ApiKeyEntry>) -> Self {
        Self {
            api_keys,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        resolve_credentials(&self.api_keys)?;

        for (label, url) in [
            ("server_base_url", &self.server_base_url),
            ("user_base_url", &self.user_base_url),
        ] {
            if url.trim().is_empty() {
                return Err(GatewayError::InvalidConfiguration {
                    reason: format!("{label} is required"),
                });
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(GatewayError::InvalidConfiguration {
                    reason: format!("{label} must start with http:// or https://"),
                });
            }
        }

        if !(self.timeout_seconds.is_finite() && self.timeout_seconds > 0.0) {
            return Err(GatewayError::InvalidConfiguration {
                reason: "timeout_seconds must be positive".to_string(),
            });
        }
        if Duration::try_from_secs_f64(self.timeout_seconds).is_err() {
            return Err(GatewayError::InvalidConfiguration {
                reason: format!("timeout_seconds {} is too large", self.timeout_seconds),
            });
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<Vec<Credential>, GatewayError> {
        resolve_credentials(&self.api_keys)
    }

    /// Absolute CA bundle path with `~` expanded.
    pub fn resolved_cert_path(&self) -> Option<PathBuf> {
        let raw = self.cert_path.as_deref().map(str::trim)?;
        if raw.is_empty() {
            return None;
        }
        let expanded = match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(raw)),
            None => PathBuf::from(raw),
        };
        if expanded.is_absolute() {
            return Some(expanded);
        }
        Some(
            std::env::current_dir()
                .map(|cwd| cwd.join(&expanded))
                .unwrap_or(expanded),
        )
    }

    pub fn parse(raw: &str, path: &Path) -> crate::Result<Self> {
        if is_yaml_path(path) {
            #[cfg(feature = "gateway-config-yaml")]
            {
                return Ok(serde_yaml::from_str(raw)?);
            }
            #[cfg(not(feature = "gateway-config-yaml"))]
            {
                return Err(SageError::Config(
                    "yaml config requires `--features gateway-config-yaml`".to_string(),
                ));
            }
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw, path)
    }

    /// Loads the explicit path if given, else the first existing default
    /// location, then applies environment overrides and validates.
    pub fn load(explicit: Option<&Path>) -> crate::Result<(Self, PathBuf)> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_config_paths()
                .into_iter()
                .find(|candidate| candidate.exists())
                .ok_or_else(|| {
                    SageError::Config(format!(
                        "no configuration file found (looked in {})",
                        default_config_paths()
                            .iter()
                            .map(|path| path.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })?,
        };

        let mut config = Self::load_file(&path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok((config, path))
    }

    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), GatewayError> {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| GatewayError::InvalidConfiguration {
                    reason: format!("invalid {ENV_PORT}: {port}"),
                })?;
        }
        if let Some(verbose) = lookup(ENV_VERBOSE) {
            self.verbose = matches!(
                verbose.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes"
            );
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut config = self.clone();
        config.cert_path = self
            .resolved_cert_path()
            .map(|path| path.display().to_string());
        let payload = encode_config(&config, path)?;

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, payload)?;
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

pub fn default_config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = dirs::home_dir() {
        out.push(
            home.join(".config")
                .join("sage_gateway")
                .join("config.yaml"),
        );
    }
    out.push(PathBuf::from("./config.yaml"));
    out.push(PathBuf::from("./sage_gateway_config.yaml"));
    out
}

fn encode_config(config: &GatewayConfig, path: &Path) -> crate::Result<Vec<u8>> {
    if is_yaml_path(path) {
        #[cfg(feature = "gateway-config-yaml")]
        {
            return Ok(serde_yaml::to_string(config)?.into_bytes());
        }
        #[cfg(not(feature = "gateway-config-yaml"))]
        {
            return Err(SageError::Config(
                "yaml config requires `--features gateway-config-yaml`".to_string(),
            ));
        }
    }
    Ok(serde_json::to_vec_pretty(config)?)
}

fn is_yaml_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_and_detailed_entries_resolve_with_generated_names() {
        let entries: Vec<ApiKeyEntry> = serde_json::from_value(json!([
            "sk-first",
            {"key": "sk-second", "weight": 2.5},
            {"key": "sk-third", "name": "backup"}
        ]))
        .expect("entries");
        let credentials = resolve_credentials(&entries).expect("credentials");
        let names: Vec<&str> = credentials.iter().map(Credential::name).collect();
        assert_eq!(names, vec!["key_1", "key_2", "backup"]);
        assert_eq!(credentials[0].weight(), 1.0);
        assert_eq!(credentials[1].weight(), 2.5);
        assert_eq!(credentials[2].weight(), 1.0);
        assert_eq!(credentials[1].secret(), "sk-second");
    }

    #[test]
    fn oversized_timeout_fails_validation() {
        let mut config = GatewayConfig::with_api_keys(vec![ApiKeyEntry::Key("sk-a".to_string())]);
        config.timeout_seconds = 1e20;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn non_positive_weight_is_rejected() {
        let entries = vec![ApiKeyEntry::weighted("sk-a", 0.0, None)];
        let err = resolve_credentials(&entries).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfiguration { .. }));

        let entries = vec![ApiKeyEntry::weighted("sk-a", -1.0, None)];
        assert!(resolve_credentials(&entries).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let entries = vec![
            ApiKeyEntry::weighted("sk-a", 1.0, Some("main")),
            ApiKeyEntry::weighted("sk-b", 1.0, Some("main")),
        ];
        let err = resolve_credentials(&entries).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn empty_key_list_is_rejected() {
        let config = GatewayConfig::default();
        assert!(matches!(
            config.validate(),
            Err(GatewayError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn urls_and_timeout_are_validated() {
        let mut config = GatewayConfig::with_api_keys(vec![ApiKeyEntry::Key("sk-a".into())]);
        assert!(config.validate().is_ok());

        config.server_base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        config.server_base_url = DEFAULT_SERVER_BASE_URL.to_string();
        config.timeout_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_host_port_and_verbose() {
        let mut config = GatewayConfig::default();
        config
            .apply_env_overrides(|name| match name {
                "SAGE_GATEWAY_HOST" => Some("127.0.0.1".to_string()),
                "SAGE_GATEWAY_PORT" => Some("9090".to_string()),
                "SAGE_GATEWAY_VERBOSE" => Some("no".to_string()),
                _ => None,
            })
            .expect("overrides");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert!(!config.verbose);

        let err = config
            .apply_env_overrides(|name| (name == "SAGE_GATEWAY_PORT").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SAGE_GATEWAY_PORT"));
    }

    #[test]
    fn debug_output_redacts_keys() {
        let config = GatewayConfig::with_api_keys(vec![ApiKeyEntry::Key("sk-hidden".into())]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-hidden"));
    }
}
