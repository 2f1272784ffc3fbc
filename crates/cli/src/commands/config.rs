use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;
use warden_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    let mut push = |key_path: &str, value: &str, env_key: &str| {
        lines.push(render_line(
            key_path,
            value,
            field_source(
                key_path,
                Some(env_key),
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        ));
    };

    push("database.url", &config.database.url, "WARDEN_DATABASE_URL");
    push(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        "WARDEN_DATABASE_MAX_CONNECTIONS",
    );
    push(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        "WARDEN_DATABASE_TIMEOUT_SECS",
    );

    push("model.provider", &format!("{:?}", config.model.provider), "WARDEN_MODEL_PROVIDER");
    push("model.model", &config.model.model, "WARDEN_MODEL_NAME");
    push(
        "model.base_url",
        config.model.base_url.as_deref().unwrap_or("<unset>"),
        "WARDEN_MODEL_BASE_URL",
    );
    let model_api_key = if config.model.api_key.is_some() { "<redacted>" } else { "<unset>" };
    push("model.api_key", model_api_key, "WARDEN_MODEL_API_KEY");

    push("server.bind_address", &config.server.bind_address, "WARDEN_SERVER_BIND_ADDRESS");
    push("server.port", &config.server.port.to_string(), "WARDEN_SERVER_PORT");
    push(
        "server.health_check_port",
        &config.server.health_check_port.to_string(),
        "WARDEN_SERVER_HEALTH_CHECK_PORT",
    );

    push("safety.phase", &format!("{:?}", config.safety.phase), "WARDEN_SAFETY_PHASE");
    push(
        "safety.approval_threshold",
        &format!("{:?}", config.safety.approval_threshold),
        "WARDEN_SAFETY_APPROVAL_THRESHOLD",
    );
    push(
        "safety.risk_ceiling",
        &format!("{:?}", config.safety.risk_ceiling),
        "WARDEN_SAFETY_RISK_CEILING",
    );
    push(
        "safety.confidence_threshold",
        &config.safety.confidence_threshold.to_string(),
        "WARDEN_SAFETY_CONFIDENCE_THRESHOLD",
    );
    push(
        "safety.token_ttl_secs",
        &config.safety.token_ttl_secs.to_string(),
        "WARDEN_SAFETY_TOKEN_TTL_SECS",
    );
    push("safety.signing_key", "<redacted>", "WARDEN_SAFETY_SIGNING_KEY");
    push(
        "safety.forbidden_data_categories",
        &config.safety.forbidden_data_categories.join(","),
        "WARDEN_SAFETY_FORBIDDEN_DATA_CATEGORIES",
    );

    push("logging.level", &config.logging.level, "WARDEN_LOGGING_LEVEL");
    push("logging.format", &format!("{:?}", config.logging.format), "WARDEN_LOGGING_FORMAT");

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("warden.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/warden.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
