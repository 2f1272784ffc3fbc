use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::plan::RiskLevel;
use crate::planner::AiPhase;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub model: ModelConfig,
    pub server: ServerConfig,
    pub safety: SafetyConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Everything the safety pipeline keys off. The signing key backs approval
/// token signatures; rotating it invalidates outstanding tokens, which is
/// the intended effect.
#[derive(Clone, Debug)]
pub struct SafetyConfig {
    pub phase: AiPhase,
    pub approval_threshold: RiskLevel,
    pub risk_ceiling: RiskLevel,
    pub confidence_threshold: f64,
    pub token_ttl_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub signing_key: SecretString,
    pub forbidden_data_categories: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub model_provider: Option<ModelProvider>,
    pub model_name: Option<String>,
    pub phase: Option<AiPhase>,
    pub signing_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://warden.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            model: ModelConfig {
                provider: ModelProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8088,
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            safety: SafetyConfig {
                phase: AiPhase::ReadOnly,
                approval_threshold: RiskLevel::High,
                risk_ceiling: RiskLevel::Critical,
                confidence_threshold: 0.6,
                token_ttl_secs: 900,
                breaker_failure_threshold: 5,
                breaker_cooldown_secs: 60,
                signing_key: String::new().into(),
                forbidden_data_categories: Vec::new(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for ModelProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported model provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

fn parse_phase(value: &str) -> Result<AiPhase, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "read_only" | "readonly" => Ok(AiPhase::ReadOnly),
        "read_write" | "readwrite" => Ok(AiPhase::ReadWrite),
        other => Err(ConfigError::Validation(format!(
            "unsupported phase `{other}` (expected read_only|read_write)"
        ))),
    }
}

fn parse_risk(field: &str, value: &str) -> Result<RiskLevel, ConfigError> {
    value.parse().map_err(|message: String| {
        ConfigError::Validation(format!("{field}: {message}"))
    })
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("warden.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(model) = patch.model {
            if let Some(provider) = model.provider {
                self.model.provider = provider;
            }
            if let Some(api_key_value) = model.api_key {
                self.model.api_key = Some(secret_value(api_key_value));
            }
            if let Some(base_url) = model.base_url {
                self.model.base_url = Some(base_url);
            }
            if let Some(name) = model.model {
                self.model.model = name;
            }
            if let Some(timeout_secs) = model.timeout_secs {
                self.model.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(safety) = patch.safety {
            if let Some(phase) = safety.phase {
                self.safety.phase = parse_phase(&phase)?;
            }
            if let Some(threshold) = safety.approval_threshold {
                self.safety.approval_threshold =
                    parse_risk("safety.approval_threshold", &threshold)?;
            }
            if let Some(ceiling) = safety.risk_ceiling {
                self.safety.risk_ceiling = parse_risk("safety.risk_ceiling", &ceiling)?;
            }
            if let Some(confidence) = safety.confidence_threshold {
                self.safety.confidence_threshold = confidence;
            }
            if let Some(ttl) = safety.token_ttl_secs {
                self.safety.token_ttl_secs = ttl;
            }
            if let Some(threshold) = safety.breaker_failure_threshold {
                self.safety.breaker_failure_threshold = threshold;
            }
            if let Some(cooldown) = safety.breaker_cooldown_secs {
                self.safety.breaker_cooldown_secs = cooldown;
            }
            if let Some(signing_key_value) = safety.signing_key {
                self.safety.signing_key = secret_value(signing_key_value);
            }
            if let Some(categories) = safety.forbidden_data_categories {
                self.safety.forbidden_data_categories = categories;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("WARDEN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("WARDEN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("WARDEN_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("WARDEN_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WARDEN_MODEL_PROVIDER") {
            self.model.provider = value.parse()?;
        }
        if let Some(value) = read_env("WARDEN_MODEL_API_KEY") {
            self.model.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("WARDEN_MODEL_BASE_URL") {
            self.model.base_url = Some(value);
        }
        if let Some(value) = read_env("WARDEN_MODEL_NAME") {
            self.model.model = value;
        }
        if let Some(value) = read_env("WARDEN_MODEL_TIMEOUT_SECS") {
            self.model.timeout_secs = parse_u64("WARDEN_MODEL_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WARDEN_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("WARDEN_SERVER_PORT") {
            self.server.port = parse_u16("WARDEN_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("WARDEN_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("WARDEN_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("WARDEN_SAFETY_PHASE") {
            self.safety.phase = parse_phase(&value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_APPROVAL_THRESHOLD") {
            self.safety.approval_threshold =
                parse_risk("WARDEN_SAFETY_APPROVAL_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_RISK_CEILING") {
            self.safety.risk_ceiling = parse_risk("WARDEN_SAFETY_RISK_CEILING", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_CONFIDENCE_THRESHOLD") {
            self.safety.confidence_threshold =
                parse_f64("WARDEN_SAFETY_CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_TOKEN_TTL_SECS") {
            self.safety.token_ttl_secs = parse_u64("WARDEN_SAFETY_TOKEN_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_BREAKER_FAILURE_THRESHOLD") {
            self.safety.breaker_failure_threshold =
                parse_u32("WARDEN_SAFETY_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_BREAKER_COOLDOWN_SECS") {
            self.safety.breaker_cooldown_secs =
                parse_u64("WARDEN_SAFETY_BREAKER_COOLDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_SAFETY_SIGNING_KEY") {
            self.safety.signing_key = secret_value(value);
        }
        if let Some(value) = read_env("WARDEN_SAFETY_FORBIDDEN_DATA_CATEGORIES") {
            self.safety.forbidden_data_categories = value
                .split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect();
        }

        let log_level =
            read_env("WARDEN_LOGGING_LEVEL").or_else(|| read_env("WARDEN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("WARDEN_LOGGING_FORMAT").or_else(|| read_env("WARDEN_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(provider) = overrides.model_provider {
            self.model.provider = provider;
        }
        if let Some(name) = overrides.model_name {
            self.model.model = name;
        }
        if let Some(phase) = overrides.phase {
            self.safety.phase = phase;
        }
        if let Some(signing_key) = overrides.signing_key {
            self.safety.signing_key = secret_value(signing_key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_model(&self.model)?;
        validate_server(&self.server)?;
        validate_safety(&self.safety)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("warden.toml"), PathBuf::from("config/warden.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_model(model: &ModelConfig) -> Result<(), ConfigError> {
    if model.timeout_secs == 0 || model.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "model.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match model.provider {
        ModelProvider::OpenAi | ModelProvider::Anthropic => {
            let missing = model
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "model.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        ModelProvider::Ollama => {
            let missing =
                model.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "model.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be greater than zero".to_string(),
        ));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_safety(safety: &SafetyConfig) -> Result<(), ConfigError> {
    let key = safety.signing_key.expose_secret();
    if key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "safety.signing_key is required; approval tokens cannot be signed without it"
                .to_string(),
        ));
    }
    if key.len() < 16 {
        return Err(ConfigError::Validation(
            "safety.signing_key must be at least 16 characters".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&safety.confidence_threshold) {
        return Err(ConfigError::Validation(
            "safety.confidence_threshold must be in range 0.0..=1.0".to_string(),
        ));
    }

    if safety.token_ttl_secs == 0 || safety.token_ttl_secs > 86_400 {
        return Err(ConfigError::Validation(
            "safety.token_ttl_secs must be in range 1..=86400".to_string(),
        ));
    }

    if safety.breaker_failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "safety.breaker_failure_threshold must be greater than zero".to_string(),
        ));
    }

    if safety.approval_threshold > safety.risk_ceiling {
        return Err(ConfigError::Validation(
            "safety.approval_threshold must not exceed safety.risk_ceiling".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    model: Option<ModelPatch>,
    server: Option<ServerPatch>,
    safety: Option<SafetyPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelPatch {
    provider: Option<ModelProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SafetyPatch {
    phase: Option<String>,
    approval_threshold: Option<String>,
    risk_ceiling: Option<String>,
    confidence_threshold: Option<f64>,
    token_ttl_secs: Option<u64>,
    breaker_failure_threshold: Option<u32>,
    breaker_cooldown_secs: Option<u64>,
    signing_key: Option<String>,
    forbidden_data_categories: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::plan::RiskLevel;
    use crate::planner::AiPhase;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_WARDEN_SIGNING_KEY", "interpolated-signing-key");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("warden.toml");
            fs::write(
                &path,
                r#"
[safety]
signing_key = "${TEST_WARDEN_SIGNING_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.safety.signing_key.expose_secret() == "interpolated-signing-key",
                "signing key should be loaded from environment",
            )
        })();

        clear_vars(&["TEST_WARDEN_SIGNING_KEY"]);
        result
    }

    #[test]
    fn safety_section_parses_risk_levels_and_phase() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("WARDEN_SAFETY_SIGNING_KEY", "a-long-enough-test-key");
        env::set_var("WARDEN_SAFETY_PHASE", "read_write");
        env::set_var("WARDEN_SAFETY_APPROVAL_THRESHOLD", "medium");
        env::set_var("WARDEN_SAFETY_RISK_CEILING", "high");
        env::set_var("WARDEN_SAFETY_FORBIDDEN_DATA_CATEGORIES", "clinical, financial");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.safety.phase == AiPhase::ReadWrite, "phase should be read_write")?;
            ensure(
                config.safety.approval_threshold == RiskLevel::Medium,
                "approval threshold should be medium",
            )?;
            ensure(
                config.safety.risk_ceiling == RiskLevel::High,
                "risk ceiling should be high",
            )?;
            ensure(
                config.safety.forbidden_data_categories
                    == vec!["clinical".to_string(), "financial".to_string()],
                "forbidden categories should be parsed from the comma list",
            )
        })();

        clear_vars(&[
            "WARDEN_SAFETY_SIGNING_KEY",
            "WARDEN_SAFETY_PHASE",
            "WARDEN_SAFETY_APPROVAL_THRESHOLD",
            "WARDEN_SAFETY_RISK_CEILING",
            "WARDEN_SAFETY_FORBIDDEN_DATA_CATEGORIES",
        ]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("WARDEN_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("WARDEN_SAFETY_SIGNING_KEY", "env-signing-key-value");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("warden.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[safety]
signing_key = "file-signing-key-value"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.safety.signing_key.expose_secret() == "env-signing-key-value",
                "env signing key should win over file and defaults",
            )
        })();

        clear_vars(&["WARDEN_DATABASE_URL", "WARDEN_SAFETY_SIGNING_KEY"]);
        result
    }

    #[test]
    fn missing_signing_key_fails_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => {
                return Err("expected validation failure but config load succeeded".to_string())
            }
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("safety.signing_key")
        );
        ensure(has_message, "validation failure should mention safety.signing_key")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("WARDEN_SAFETY_SIGNING_KEY", "super-secret-hmac-key");
        env::set_var("WARDEN_MODEL_API_KEY", "sk-super-secret-api-key");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("super-secret-hmac-key"),
                "debug output should not contain the signing key",
            )?;
            ensure(
                !debug.contains("sk-super-secret-api-key"),
                "debug output should not contain the model api key",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["WARDEN_SAFETY_SIGNING_KEY", "WARDEN_MODEL_API_KEY"]);
        result
    }
}
