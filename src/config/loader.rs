//! Load settings from the environment and model definitions from JSON.

use crate::config::types::{ModelConfig, Settings};
use crate::config::validate_models;
use crate::error::ConfigError;
use std::path::Path;
use std::time::Duration;

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Load(format!("{} is not a valid value: {}", name, v))),
        _ => Ok(None),
    }
}

impl Settings {
    /// Read settings from the process environment, loading `.env` first when present.
    ///
    /// `DATABASE_URL`, `RAILCAR_SCHEMA`, `RAILCAR_DB_DEBUG`, `RAILCAR_BIND`,
    /// `RAILCAR_CHARSET`, `RAILCAR_CORS_ORIGIN`, `RAILCAR_SESSION_COOKIE`,
    /// `RAILCAR_SESSION_MAX_AGE` (seconds), `RAILCAR_CACHE_TTL` (seconds),
    /// `RAILCAR_BODY_LIMIT` (bytes).
    pub fn from_env() -> Result<Settings, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Settings::default();
        Ok(Settings {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            schema: std::env::var("RAILCAR_SCHEMA").unwrap_or(defaults.schema),
            db_debug: env_flag("RAILCAR_DB_DEBUG"),
            bind: std::env::var("RAILCAR_BIND").unwrap_or(defaults.bind),
            charset: std::env::var("RAILCAR_CHARSET").unwrap_or(defaults.charset),
            cors_origin: std::env::var("RAILCAR_CORS_ORIGIN").ok().filter(|s| !s.is_empty()),
            session_cookie: std::env::var("RAILCAR_SESSION_COOKIE").unwrap_or(defaults.session_cookie),
            session_max_age: env_parse::<u64>("RAILCAR_SESSION_MAX_AGE")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_max_age),
            cache_ttl: env_parse::<u64>("RAILCAR_CACHE_TTL")?.map(Duration::from_secs),
            body_limit: env_parse::<usize>("RAILCAR_BODY_LIMIT")?.unwrap_or(defaults.body_limit),
        })
    }
}

/// Parse model definitions from a JSON array and validate them.
pub fn models_from_json(json: &str) -> Result<Vec<ModelConfig>, ConfigError> {
    let models: Vec<ModelConfig> =
        serde_json::from_str(json).map_err(|e| ConfigError::Load(format!("models: {}", e)))?;
    validate_models(&models)?;
    Ok(models)
}

/// Read and parse a `models.json` file.
pub async fn load_models_from_file(path: impl AsRef<Path>) -> Result<Vec<ModelConfig>, ConfigError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    models_from_json(&text)
}
