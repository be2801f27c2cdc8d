use diagnosis_flow::ChatPolicy;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid value for {name}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub reason: String,
}

/// Settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub model_id: String,
    pub max_tokens: u32,
    pub literature_search: bool,
    pub chat_policy: ChatPolicy,
    pub chat_history_limit: usize,
    pub max_upload_bytes: usize,
    pub temp_dir: PathBuf,
    /// Sessions untouched for this many minutes are dropped. 0 keeps them until the process exits.
    pub session_idle_minutes: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            model_id: "google/gemini-2.0-flash-001".to_string(),
            max_tokens: 4000,
            literature_search: true,
            chat_policy: ChatPolicy::RejectWithoutAnalysis,
            chat_history_limit: 6,
            max_upload_bytes: 20 * 1024 * 1024,
            temp_dir: std::env::temp_dir(),
            session_idle_minutes: 60,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. Unset or blank variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(port) = get("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(model_id) = get("MODEL_ID") {
            config.model_id = model_id.trim().to_string();
        }
        if let Some(max_tokens) = get("MAX_TOKENS") {
            config.max_tokens = parse("MAX_TOKENS", &max_tokens)?;
        }
        if let Some(search) = get("LITERATURE_SEARCH") {
            config.literature_search = parse_bool("LITERATURE_SEARCH", &search)?;
        }
        if let Some(policy) = get("CHAT_WITHOUT_ANALYSIS") {
            config.chat_policy = policy.parse().map_err(|reason| ConfigError {
                name: "CHAT_WITHOUT_ANALYSIS",
                reason,
            })?;
        }
        if let Some(limit) = get("CHAT_HISTORY_LIMIT") {
            config.chat_history_limit = parse("CHAT_HISTORY_LIMIT", &limit)?;
        }
        if let Some(max_upload) = get("MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse("MAX_UPLOAD_BYTES", &max_upload)?;
        }
        if let Some(dir) = get("TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir.trim());
        }
        if let Some(minutes) = get("SESSION_IDLE_MINUTES") {
            config.session_idle_minutes = parse("SESSION_IDLE_MINUTES", &minutes)?;
        }

        Ok(config)
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        name,
        reason: e.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError {
            name,
            reason: format!("expected a boolean, got '{}'", other),
        }),
    }
}
