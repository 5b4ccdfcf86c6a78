use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::toggles::{ErrorRate, DEFAULT_HALLUCINATION_USER};

pub const CONFIG_FILE_NAME: &str = "opsdesk.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub toggles: TogglesConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub policy_top_k: usize,
    pub max_orders: usize,
    pub max_refund_requests: usize,
    pub max_tickets: usize,
    pub leaf_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TogglesConfig {
    pub policy_drift: bool,
    pub llm_hallucination: bool,
    pub hallucination_user_id: String,
    pub api_error_rate: f64,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Deterministic keyword classifier, no network calls.
    Offline,
    #[serde(rename = "openai")]
    OpenAi,
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
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub policy_drift: Option<bool>,
    pub llm_hallucination: Option<bool>,
    pub api_error_rate: Option<f64>,
    pub seed: Option<u64>,
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
            llm: LlmConfig {
                provider: LlmProvider::Offline,
                api_key: None,
                base_url: None,
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            pipeline: PipelineConfig::default(),
            toggles: TogglesConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy_top_k: 10,
            max_orders: 5,
            max_refund_requests: 3,
            max_tickets: 5,
            leaf_timeout_ms: 5_000,
        }
    }
}

impl Default for TogglesConfig {
    fn default() -> Self {
        Self {
            policy_drift: false,
            llm_hallucination: false,
            hallucination_user_id: DEFAULT_HALLUCINATION_USER.to_string(),
            api_error_rate: 0.0,
            seed: None,
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(Self::Offline),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected offline|openai|ollama)"
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

impl LlmConfig {
    /// Base URL for the chat-completions endpoint, falling back to the
    /// provider's conventional default.
    pub fn effective_base_url(&self) -> String {
        match (&self.base_url, self.provider) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, LlmProvider::Ollama) => "http://localhost:11434".to_string(),
            (None, _) => "https://api.openai.com".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(policy_top_k) = pipeline.policy_top_k {
                self.pipeline.policy_top_k = policy_top_k;
            }
            if let Some(max_orders) = pipeline.max_orders {
                self.pipeline.max_orders = max_orders;
            }
            if let Some(max_refund_requests) = pipeline.max_refund_requests {
                self.pipeline.max_refund_requests = max_refund_requests;
            }
            if let Some(max_tickets) = pipeline.max_tickets {
                self.pipeline.max_tickets = max_tickets;
            }
            if let Some(leaf_timeout_ms) = pipeline.leaf_timeout_ms {
                self.pipeline.leaf_timeout_ms = leaf_timeout_ms;
            }
        }

        if let Some(toggles) = patch.toggles {
            if let Some(policy_drift) = toggles.policy_drift {
                self.toggles.policy_drift = policy_drift;
            }
            if let Some(llm_hallucination) = toggles.llm_hallucination {
                self.toggles.llm_hallucination = llm_hallucination;
            }
            if let Some(hallucination_user_id) = toggles.hallucination_user_id {
                self.toggles.hallucination_user_id = hallucination_user_id;
            }
            if let Some(api_error_rate) = toggles.api_error_rate {
                self.toggles.api_error_rate = api_error_rate;
            }
            if let Some(seed) = toggles.seed {
                self.toggles.seed = Some(seed);
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
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("OPSDESK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("OPSDESK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("OPSDESK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("OPSDESK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("OPSDESK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("OPSDESK_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("OPSDESK_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("OPSDESK_PIPELINE_POLICY_TOP_K") {
            self.pipeline.policy_top_k = parse_usize("OPSDESK_PIPELINE_POLICY_TOP_K", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_PIPELINE_MAX_ORDERS") {
            self.pipeline.max_orders = parse_usize("OPSDESK_PIPELINE_MAX_ORDERS", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_PIPELINE_MAX_REFUND_REQUESTS") {
            self.pipeline.max_refund_requests =
                parse_usize("OPSDESK_PIPELINE_MAX_REFUND_REQUESTS", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_PIPELINE_MAX_TICKETS") {
            self.pipeline.max_tickets = parse_usize("OPSDESK_PIPELINE_MAX_TICKETS", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_PIPELINE_LEAF_TIMEOUT_MS") {
            self.pipeline.leaf_timeout_ms = parse_u64("OPSDESK_PIPELINE_LEAF_TIMEOUT_MS", &value)?;
        }

        let drift = env_with_alias("OPSDESK_TOGGLES_POLICY_DRIFT", "POLICY_DRIFT");
        if let Some((key, value)) = drift {
            self.toggles.policy_drift = parse_bool(key, &value)?;
        }
        if let Some(value) = read_env("OPSDESK_TOGGLES_LLM_HALLUCINATION") {
            self.toggles.llm_hallucination =
                parse_bool("OPSDESK_TOGGLES_LLM_HALLUCINATION", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_TOGGLES_HALLUCINATION_USER_ID") {
            self.toggles.hallucination_user_id = value;
        }
        let error_rate = env_with_alias("OPSDESK_TOGGLES_API_ERROR_RATE", "REFUND_API_ERROR_RATE");
        if let Some((key, value)) = error_rate {
            self.toggles.api_error_rate = parse_f64(key, &value)?;
        }
        if let Some(value) = read_env("OPSDESK_TOGGLES_SEED") {
            self.toggles.seed = Some(parse_u64("OPSDESK_TOGGLES_SEED", &value)?);
        }

        let log_level =
            read_env("OPSDESK_LOGGING_LEVEL").or_else(|| read_env("OPSDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("OPSDESK_LOGGING_FORMAT").or_else(|| read_env("OPSDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(policy_drift) = overrides.policy_drift {
            self.toggles.policy_drift = policy_drift;
        }
        if let Some(llm_hallucination) = overrides.llm_hallucination {
            self.toggles.llm_hallucination = llm_hallucination;
        }
        if let Some(api_error_rate) = overrides.api_error_rate {
            self.toggles.api_error_rate = api_error_rate;
        }
        if let Some(seed) = overrides.seed {
            self.toggles.seed = Some(seed);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_pipeline(&self.pipeline)?;
        validate_toggles(&self.toggles)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(CONFIG_FILE_NAME), PathBuf::from("config").join(CONFIG_FILE_NAME)]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_retries > 10 {
        return Err(ConfigError::Validation("llm.max_retries must be at most 10".to_string()));
    }

    match llm.provider {
        LlmProvider::Offline => {}
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let blank = llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(false);
            if blank {
                return Err(ConfigError::Validation(
                    "llm.base_url must not be blank for the ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.policy_top_k == 0 || pipeline.policy_top_k > 100 {
        return Err(ConfigError::Validation(
            "pipeline.policy_top_k must be in range 1..=100".to_string(),
        ));
    }

    if pipeline.max_orders == 0 || pipeline.max_refund_requests == 0 || pipeline.max_tickets == 0
    {
        return Err(ConfigError::Validation(
            "pipeline.max_orders, pipeline.max_refund_requests and pipeline.max_tickets must be greater than zero"
                .to_string(),
        ));
    }

    if pipeline.leaf_timeout_ms == 0 || pipeline.leaf_timeout_ms > 120_000 {
        return Err(ConfigError::Validation(
            "pipeline.leaf_timeout_ms must be in range 1..=120000".to_string(),
        ));
    }

    Ok(())
}

fn validate_toggles(toggles: &TogglesConfig) -> Result<(), ConfigError> {
    if ErrorRate::new(toggles.api_error_rate).is_err() {
        return Err(ConfigError::Validation(format!(
            "toggles.api_error_rate must be in range [0, 1), got {}",
            toggles.api_error_rate
        )));
    }

    if toggles.hallucination_user_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "toggles.hallucination_user_id must not be empty".to_string(),
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

/// Reads `primary`, falling back to a legacy variable name.
fn env_with_alias(primary: &'static str, alias: &'static str) -> Option<(&'static str, String)> {
    read_env(primary)
        .map(|value| (primary, value))
        .or_else(|| read_env(alias).map(|value| (alias, value)))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid_override(key, value)),
    }
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    pipeline: Option<PipelinePatch>,
    toggles: Option<TogglesPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    policy_top_k: Option<usize>,
    max_orders: Option<usize>,
    max_refund_requests: Option<usize>,
    max_tickets: Option<usize>,
    leaf_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TogglesPatch {
    policy_drift: Option<bool>,
    llm_hallucination: Option<bool>,
    hallucination_user_id: Option<String>,
    api_error_rate: Option<f64>,
    seed: Option<u64>,
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

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const ENV_KEYS: &[&str] = &[
        "OPSDESK_LLM_PROVIDER",
        "OPSDESK_LLM_API_KEY",
        "OPSDESK_LOG_LEVEL",
        "OPSDESK_LOG_FORMAT",
        "OPSDESK_TOGGLES_POLICY_DRIFT",
        "OPSDESK_TOGGLES_API_ERROR_RATE",
        "POLICY_DRIFT",
        "REFUND_API_ERROR_RATE",
    ];

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
    fn defaults_are_offline_and_fault_free() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.provider == LlmProvider::Offline, "default provider is offline")?;
        ensure(!config.toggles.policy_drift, "drift is off by default")?;
        ensure(config.toggles.api_error_rate == 0.0, "no simulated errors by default")?;
        ensure(config.pipeline.policy_top_k == 10, "default top-k is 10")?;
        ensure(config.pipeline.max_refund_requests == 3, "default refund request limit is 3")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        env::set_var("TEST_OPSDESK_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("opsdesk.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_OPSDESK_LLM_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )
        })();

        clear_vars(&["TEST_OPSDESK_LLM_KEY"]);
        result
    }

    #[test]
    fn legacy_toggle_env_names_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        env::set_var("POLICY_DRIFT", "true");
        env::set_var("REFUND_API_ERROR_RATE", "0.4");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.toggles.policy_drift, "drift should be enabled by alias")?;
            ensure(
                (config.toggles.api_error_rate - 0.4).abs() < f64::EPSILON,
                "error rate should be read from alias",
            )
        })();

        clear_vars(&["POLICY_DRIFT", "REFUND_API_ERROR_RATE"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        env::set_var("OPSDESK_TOGGLES_API_ERROR_RATE", "0.2");
        env::set_var("OPSDESK_LOG_LEVEL", "warn");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("opsdesk.toml");
            fs::write(
                &path,
                r#"
[toggles]
api_error_rate = 0.1
policy_drift = true

[pipeline]
max_tickets = 2

[logging]
level = "error"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    policy_drift: Some(false),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.pipeline.max_tickets == 2, "file value should beat default")?;
            ensure(
                (config.toggles.api_error_rate - 0.2).abs() < f64::EPSILON,
                "env error rate should win over file",
            )?;
            ensure(!config.toggles.policy_drift, "override should win over file")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")
        })();

        clear_vars(&["OPSDESK_TOGGLES_API_ERROR_RATE", "OPSDESK_LOG_LEVEL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides { api_error_rate: Some(1.0), ..ConfigOverrides::default() },
            ..LoadOptions::default()
        }) {
            Ok(_) => {
                return Err("expected validation failure but config load succeeded".to_string())
            }
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("toggles.api_error_rate")
        );
        ensure(has_message, "validation failure should mention toggles.api_error_rate")
    }

    #[test]
    fn openai_provider_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        env::set_var("OPSDESK_LLM_PROVIDER", "openai");
        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("openai without a key should fail validation".to_string()),
            Err(ConfigError::Validation(message)) if message.contains("llm.api_key") => Ok(()),
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["OPSDESK_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        env::set_var("OPSDESK_LLM_PROVIDER", "openai");
        env::set_var("OPSDESK_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")
        })();

        clear_vars(&["OPSDESK_LLM_PROVIDER", "OPSDESK_LLM_API_KEY"]);
        result
    }

    #[test]
    fn invalid_env_override_names_the_variable() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ENV_KEYS);

        env::set_var("OPSDESK_TOGGLES_POLICY_DRIFT", "sometimes");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. })
                if key == "OPSDESK_TOGGLES_POLICY_DRIFT" =>
            {
                Ok(())
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("invalid boolean should be rejected".to_string()),
        };

        clear_vars(&["OPSDESK_TOGGLES_POLICY_DRIFT"]);
        result
    }
}
