//! Configuration management for gcli2api.
//!
//! Two layers of configuration exist:
//!
//! 1. **Environment configuration** ([`Config`]) — read once at startup.
//!    - `HOST` / `PORT` - Server bind address. Defaults to `0.0.0.0:7861`.
//!    - `POSTGRES_DSN` - Selects the PostgreSQL storage backend.
//!    - `VALKEY_URL` / `REDIS_URL` - Selects the Valkey/Redis storage backend.
//!    - `CREDENTIALS_DIR` - File-store root used when no database is configured.
//!    - `API_PASSWORD` - Bearer password for inbound auth.
//!    - `CODE_ASSIST_ENDPOINT` - Override for the Gemini backend base URL.
//!    - `PICGO_UPLOAD_ENABLED` / `PICGO_UPLOAD_URL` / `PICGO_API_KEY` - Image rehosting.
//!
//! 2. **Dynamic configuration** ([`GatewaySettings`]) — key/value pairs stored
//!    in the storage backend's config table and served from its in-memory
//!    cache, so they can be changed without a restart.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Default Gemini backend base URL (Code Assist API surface).
pub const DEFAULT_CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";

/// Default image host endpoint (Chevereto v1 style).
pub const DEFAULT_PICGO_UPLOAD_URL: &str = "https://www.picgo.net/api/1/upload";

/// Image rehosting configuration.
#[derive(Debug, Clone, Default)]
pub struct PicgoConfig {
    /// Whether rehosting of inline images is enabled.
    pub enabled: bool,
    /// Upload endpoint URL.
    pub upload_url: String,
    /// Chevereto-style API key.
    pub api_key: Option<String>,
}

/// Environment configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// PostgreSQL DSN (first storage choice when set)
    pub postgres_dsn: Option<String>,

    /// Valkey/Redis URL (second storage choice when set)
    pub valkey_url: Option<String>,

    /// File-store root when no database is configured
    pub credentials_dir: PathBuf,

    /// Bearer password from the environment (overrides the stored one)
    pub api_password: Option<String>,

    /// Gemini backend base URL
    pub code_assist_endpoint: String,

    /// Image rehosting configuration
    pub picgo: PicgoConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "7861".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let postgres_dsn = std::env::var("POSTGRES_DSN").ok().filter(|v| !v.is_empty());
        let valkey_url = std::env::var("VALKEY_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .ok()
            .filter(|v| !v.is_empty());

        let credentials_dir = std::env::var("CREDENTIALS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./creds"));

        let picgo = PicgoConfig {
            enabled: std::env::var("PICGO_UPLOAD_ENABLED")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            upload_url: std::env::var("PICGO_UPLOAD_URL")
                .unwrap_or_else(|_| DEFAULT_PICGO_UPLOAD_URL.to_string()),
            api_key: std::env::var("PICGO_API_KEY").ok().filter(|v| !v.is_empty()),
        };

        Ok(Self {
            host,
            port,
            postgres_dsn,
            valkey_url,
            credentials_dir,
            api_password: std::env::var("API_PASSWORD").ok().filter(|v| !v.is_empty()),
            code_assist_endpoint: std::env::var("CODE_ASSIST_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_CODE_ASSIST_ENDPOINT.to_string()),
            picgo,
        })
    }
}

/// Typed accessors over the dynamic config store.
///
/// Every getter reads through the storage adapter's config cache, so values
/// updated via `set_config` take effect on the next request. The environment
/// password, when present, takes precedence over the stored one.
#[derive(Clone)]
pub struct GatewaySettings {
    storage: Arc<dyn Storage>,
    env_password: Option<String>,
}

impl GatewaySettings {
    pub fn new(storage: Arc<dyn Storage>, env_password: Option<String>) -> Self {
        Self {
            storage,
            env_password,
        }
    }

    async fn get_str(&self, key: &str) -> Option<String> {
        match self.storage.get_config(key).await? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    async fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.storage
            .get_config(key)
            .await
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    async fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.storage
            .get_config(key)
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.storage
            .get_config(key)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Bearer password for inbound requests.
    pub async fn api_password(&self) -> String {
        if let Some(p) = &self.env_password {
            return p.clone();
        }
        self.get_str("api_password")
            .await
            .unwrap_or_else(|| "pwd".to_string())
    }

    /// Force all `system` messages to `user` and drop `systemInstruction`.
    pub async fn compatibility_mode(&self) -> bool {
        self.get_bool("compatibility_mode", false).await
    }

    /// Per-model cooldown applied after a 429, in seconds.
    pub async fn cooldown_429_seconds(&self) -> f64 {
        self.get_f64("cooldown_429_seconds", 60.0).await
    }

    /// Maximum continuation attempts for anti-truncation streaming.
    pub async fn anti_truncation_max_attempts(&self) -> u32 {
        self.get_u64("anti_truncation_max_attempts", 3).await as u32
    }

    /// Prompt appended as a user turn when continuing a truncated stream.
    pub async fn continuation_prompt(&self) -> String {
        self.get_str("continuation_prompt")
            .await
            .unwrap_or_else(|| "continue".to_string())
    }

    /// Upstream finish reasons that trigger a continuation attempt.
    pub async fn truncation_finish_reasons(&self) -> Vec<String> {
        match self.storage.get_config("truncation_finish_reasons").await {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => vec!["MAX_TOKENS".to_string()],
        }
    }

    /// Fake-streaming heartbeat interval, in seconds.
    pub async fn heartbeat_interval_seconds(&self) -> u64 {
        self.get_u64("heartbeat_interval_seconds", 3).await
    }

    /// Unary backend call timeout, in seconds.
    pub async fn request_timeout_seconds(&self) -> u64 {
        self.get_u64("request_timeout_seconds", 300).await
    }

    /// Base model names advertised (and crossed with feature suffixes).
    pub async fn base_models(&self) -> Vec<String> {
        match self.storage.get_config("base_models").await {
            Some(Value::Array(items)) => {
                let models: Vec<String> = items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect();
                if models.is_empty() {
                    default_base_models()
                } else {
                    models
                }
            }
            _ => default_base_models(),
        }
    }
}

fn default_base_models() -> Vec<String> {
    vec!["gemini-2.5-pro".to_string(), "gemini-2.5-flash".to_string()]
}

/// Safety settings attached to every outbound Gemini request.
pub fn default_safety_settings() -> Vec<crate::models::SafetySetting> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
        "HARM_CATEGORY_CIVIC_INTEGRITY",
    ]
    .iter()
    .map(|category| crate::models::SafetySetting {
        category: category.to_string(),
        threshold: "OFF".to_string(),
    })
    .collect()
}
