use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use viva_core::SessionConfig;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub jwt_secret: SecretString,
    pub openai_api_key: Option<SecretString>,
    pub openai_base_url: String,
    pub chat_model: String,
    pub transcription_model: String,
    pub database_url: Option<SecretString>,
    pub database_max_connections: u32,
    pub question_bank_dir: Option<PathBuf>,
    pub session: SessionConfig,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// This function will look for a `.env` file in the current directory
    /// and load the following variables:
    ///
    /// *   `BIND_ADDRESS`: The address and port to bind the server to. Defaults to "0.0.0.0:3000".
    /// *   `JWT_SECRET`: The HS256 secret credentials are signed with. Required.
    /// *   `OPENAI_API_KEY`: Key for transcription and evaluation. Required to serve.
    /// *   `OPENAI_BASE_URL`: (Optional) API root. Defaults to "https://api.openai.com/v1".
    /// *   `CHAT_MODEL`: (Optional) The evaluation model. Defaults to "gpt-4o".
    /// *   `TRANSCRIPTION_MODEL`: (Optional) Defaults to "whisper-1".
    /// *   `DATABASE_URL`: (Optional) Postgres URL. In-memory stores are used when unset.
    /// *   `DATABASE_MAX_CONNECTIONS`: (Optional) Pool size. Defaults to 10.
    /// *   `QUESTION_BANK_DIR`: (Optional) Directory of question banks loaded at startup.
    /// *   `QUESTION_TIMEOUT_SECS`, `TRANSCRIPTION_TIMEOUT_SECS`, `EVALUATION_TIMEOUT_SECS`,
    ///     `PERSISTENCE_TIMEOUT_SECS`: (Optional) Per-call limits. Default 5, 30, 60 and 5.
    /// *   `ADAPTER_MAX_ATTEMPTS`: (Optional) Attempts per external call. Defaults to 2.
    /// *   `SESSION_QUEUE_DEPTH`: (Optional) Requests that may queue per session. Defaults to 8.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let jwt_secret = var("JWT_SECRET")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("JWT_SECRET".to_string()))?;

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            question_timeout: seconds(&var, "QUESTION_TIMEOUT_SECS", defaults.question_timeout)?,
            transcription_timeout: seconds(
                &var,
                "TRANSCRIPTION_TIMEOUT_SECS",
                defaults.transcription_timeout,
            )?,
            evaluation_timeout: seconds(&var, "EVALUATION_TIMEOUT_SECS", defaults.evaluation_timeout)?,
            persistence_timeout: seconds(
                &var,
                "PERSISTENCE_TIMEOUT_SECS",
                defaults.persistence_timeout,
            )?,
            max_attempts: positive(&var, "ADAPTER_MAX_ATTEMPTS", defaults.max_attempts)?,
            queue_depth: positive(&var, "SESSION_QUEUE_DEPTH", defaults.queue_depth)?,
        };

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            jwt_secret,
            openai_api_key: var("OPENAI_API_KEY").map(SecretString::from),
            openai_base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| viva_core::OPENAI_API_BASE.to_string()),
            chat_model: var("CHAT_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            transcription_model: var("TRANSCRIPTION_MODEL")
                .unwrap_or_else(|| "whisper-1".to_string()),
            database_url: var("DATABASE_URL").map(SecretString::from),
            database_max_connections: positive(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
            question_bank_dir: var("QUESTION_BANK_DIR").map(PathBuf::from),
            session,
            log_level,
        })
    }

    /// The OpenAI key, which is only needed when actually serving.
    pub fn require_openai_key(&self) -> Result<&SecretString, ConfigError> {
        self.openai_api_key
            .as_ref()
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))
    }
}

fn seconds(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    positive(var, name, default.as_secs()).map(Duration::from_secs)
}

fn positive<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + From<u8>,
{
    let Some(raw) = var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::from(0) => Ok(value),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{raw}' is not a positive whole number"),
        )),
    }
}
