//! Configuration management for the agent platform.
//!
//! Configuration is read from environment variables:
//! - `DATABASE_PATH` - Optional. SQLite file. Defaults to `./agent_platform.db`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8000`.
//! - `ENCRYPTION_KEY` - Required. 32-byte key, hex or base64.
//! - `JWT_SECRET` - Required unless `DEV_MODE` is set.
//! - `JWT_TTL_MINUTES` - Optional. Access token lifetime. Defaults to `30`.
//! - `DEV_MODE` - Optional. Disables auth checks. Defaults to `false`.
//! - `LLM_API_KEY` - Optional. Bearer key for the LLM provider.
//! - `LLM_API_URL` - Optional. OpenAI-compatible chat completions endpoint.
//! - `CONFIG_RELOAD_INTERVAL_SECS` - Optional. Config cache refresh interval. Defaults to `30`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::crypto::Cipher;
use crate::util::env_var_bool;

pub const DEFAULT_LLM_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Token authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for access tokens
    pub jwt_secret: Option<String>,

    /// Token lifetime in minutes
    pub jwt_ttl_minutes: i64,
}

impl AuthConfig {
    pub fn auth_required(&self, dev_mode: bool) -> bool {
        !dev_mode
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub cipher: Cipher,
    pub dev_mode: bool,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub config_reload_interval: Duration,
}

fn parse_env<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `ENCRYPTION_KEY` is not set, or
    /// if `JWT_SECRET` is not set outside dev mode.
    pub fn from_env() -> Result<Self, ConfigError> {
        let key = non_empty_env("ENCRYPTION_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("ENCRYPTION_KEY".to_string()))?;
        let cipher = Cipher::from_key_str(&key)
            .map_err(|e| ConfigError::InvalidValue("ENCRYPTION_KEY".to_string(), e.to_string()))?;

        let dev_mode = env_var_bool("DEV_MODE", false);
        let jwt_secret = non_empty_env("JWT_SECRET");
        if jwt_secret.is_none() && !dev_mode {
            return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
        }

        let jwt_ttl_minutes: i64 = parse_env("JWT_TTL_MINUTES", "30")?;
        if jwt_ttl_minutes <= 0 {
            return Err(ConfigError::InvalidValue(
                "JWT_TTL_MINUTES".to_string(),
                "must be positive".to_string(),
            ));
        }

        let reload_secs: u64 = parse_env("CONFIG_RELOAD_INTERVAL_SECS", "30")?;
        if reload_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "CONFIG_RELOAD_INTERVAL_SECS".to_string(),
                "must be positive".to_string(),
            ));
        }

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./agent_platform.db")),
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("PORT", "8000")?,
            cipher,
            dev_mode,
            auth: AuthConfig {
                jwt_secret,
                jwt_ttl_minutes,
            },
            llm: LlmConfig {
                api_key: non_empty_env("LLM_API_KEY"),
                api_url: non_empty_env("LLM_API_URL")
                    .unwrap_or_else(|| DEFAULT_LLM_API_URL.to_string()),
            },
            config_reload_interval: Duration::from_secs(reload_secs),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(database_path: PathBuf, cipher: Cipher, jwt_secret: Option<String>) -> Self {
        Self {
            database_path,
            host: "127.0.0.1".to_string(),
            port: 8000,
            cipher,
            dev_mode: false,
            auth: AuthConfig {
                jwt_secret,
                jwt_ttl_minutes: 30,
            },
            llm: LlmConfig {
                api_key: None,
                api_url: DEFAULT_LLM_API_URL.to_string(),
            },
            config_reload_interval: Duration::from_secs(30),
        }
    }
}
