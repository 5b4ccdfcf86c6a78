use std::env;
use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value as Json};
use toml::Value;

use opsdesk_core::config::{resolve_config_path, AppConfig, LoadOptions};

use crate::commands::{serialize_payload, CommandResult, EXIT_CONFIG};

const COMMAND: &str = "config";

/// Prints the effective configuration with per-field source attribution.
/// Source precedence: env > file > default.
pub fn run(config_path: Option<&Path>) -> CommandResult {
    let options = LoadOptions {
        config_path: config_path.map(Path::to_path_buf),
        require_file: config_path.is_some(),
        ..LoadOptions::default()
    };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                format!("config validation failed: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    let file_path = resolve_config_path(config_path);
    let file_doc = file_path.as_deref().and_then(load_config_file_doc);
    let sources = Sources { file_doc: file_doc.as_ref(), file_path: file_path.as_deref() };

    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let fields = [
        ("llm.provider", json!(config.llm.provider), "OPSDESK_LLM_PROVIDER"),
        ("llm.model", json!(config.llm.model), "OPSDESK_LLM_MODEL"),
        ("llm.base_url", json!(config.llm.effective_base_url()), "OPSDESK_LLM_BASE_URL"),
        ("llm.api_key", json!(llm_api_key), "OPSDESK_LLM_API_KEY"),
        ("llm.timeout_secs", json!(config.llm.timeout_secs), "OPSDESK_LLM_TIMEOUT_SECS"),
        ("llm.max_retries", json!(config.llm.max_retries), "OPSDESK_LLM_MAX_RETRIES"),
        (
            "pipeline.policy_top_k",
            json!(config.pipeline.policy_top_k),
            "OPSDESK_PIPELINE_POLICY_TOP_K",
        ),
        ("pipeline.max_orders", json!(config.pipeline.max_orders), "OPSDESK_PIPELINE_MAX_ORDERS"),
        (
            "pipeline.max_refund_requests",
            json!(config.pipeline.max_refund_requests),
            "OPSDESK_PIPELINE_MAX_REFUND_REQUESTS",
        ),
        (
            "pipeline.max_tickets",
            json!(config.pipeline.max_tickets),
            "OPSDESK_PIPELINE_MAX_TICKETS",
        ),
        (
            "pipeline.leaf_timeout_ms",
            json!(config.pipeline.leaf_timeout_ms),
            "OPSDESK_PIPELINE_LEAF_TIMEOUT_MS",
        ),
        (
            "toggles.policy_drift",
            json!(config.toggles.policy_drift),
            "OPSDESK_TOGGLES_POLICY_DRIFT",
        ),
        (
            "toggles.llm_hallucination",
            json!(config.toggles.llm_hallucination),
            "OPSDESK_TOGGLES_LLM_HALLUCINATION",
        ),
        (
            "toggles.hallucination_user_id",
            json!(config.toggles.hallucination_user_id),
            "OPSDESK_TOGGLES_HALLUCINATION_USER_ID",
        ),
        (
            "toggles.api_error_rate",
            json!(config.toggles.api_error_rate),
            "OPSDESK_TOGGLES_API_ERROR_RATE",
        ),
        ("toggles.seed", json!(config.toggles.seed), "OPSDESK_TOGGLES_SEED"),
        ("logging.level", json!(config.logging.level), "OPSDESK_LOGGING_LEVEL"),
        ("logging.format", json!(config.logging.format), "OPSDESK_LOGGING_FORMAT"),
    ];

    let mut effective = Map::new();
    for (key, value, env_key) in fields {
        effective.insert(
            key.to_string(),
            json!({ "value": value, "source": sources.field_source(key, env_key) }),
        );
    }

    let payload = json!({
        "command": COMMAND,
        "status": "ok",
        "config_file": file_path.map(|path| path.display().to_string()),
        "effective": Json::Object(effective),
    });
    CommandResult { exit_code: 0, output: serialize_payload(&payload) }
}

struct Sources<'a> {
    file_doc: Option<&'a Value>,
    file_path: Option<&'a Path>,
}

impl Sources<'_> {
    fn field_source(&self, key_path: &str, env_key: &str) -> String {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }

        if let Some(doc) = self.file_doc {
            if contains_path(doc, key_path) {
                let file_path = self
                    .file_path
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "config file".to_string());
                return format!("file ({file_path})");
            }
        }

        "default".to_string()
    }
}

fn load_config_file_doc(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
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

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn nested_keys_are_found_in_toml_documents() {
        let doc: toml::Value = "[toggles]\napi_error_rate = 0.2\n".parse().expect("valid toml");
        assert!(contains_path(&doc, "toggles.api_error_rate"));
        assert!(!contains_path(&doc, "toggles.seed"));
        assert!(!contains_path(&doc, "llm.model"));
    }
}
