pub mod batch;
pub mod config;
pub mod run;
pub mod scenarios;

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use tokio::task::JoinHandle;

use opsdesk_agent::CancellationFlag;
use opsdesk_core::config::{AppConfig, ConfigOverrides, LoadOptions};
use opsdesk_core::toggles::{FaultToggles, ToggleName};

pub const EXIT_OK: u8 = 0;
pub const EXIT_INTERNAL: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_ABORTED: u8 = 3;
pub const EXIT_CANCELLED: u8 = 4;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: EXIT_OK, output: serialize_payload(&payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(&payload) }
    }
}

/// Fault-injection flags shared by `run` and `batch`. They override the
/// `[toggles]` section and the `OPSDESK_TOGGLES_*` environment.
#[derive(Debug, Clone, Default, Args)]
pub struct ToggleArgs {
    #[arg(
        long,
        num_args = 1..,
        value_name = "TOGGLE",
        help = "Enable toggles: drift, hallucination"
    )]
    pub toggles: Vec<String>,
    #[arg(long, value_name = "RATE", help = "Probability in [0, 1) that a tool call fails")]
    pub api_error_rate: Option<f64>,
    #[arg(long, help = "Seed for reproducible simulated tool failures")]
    pub seed: Option<u64>,
}

impl ToggleArgs {
    fn overrides(&self) -> Result<ConfigOverrides, String> {
        let mut overrides = ConfigOverrides {
            api_error_rate: self.api_error_rate,
            seed: self.seed,
            ..ConfigOverrides::default()
        };
        for raw in &self.toggles {
            match ToggleName::parse(raw).map_err(|error| error.to_string())? {
                ToggleName::Drift => overrides.policy_drift = Some(true),
                ToggleName::Hallucination => overrides.llm_hallucination = Some(true),
            }
        }
        Ok(overrides)
    }
}

/// Configuration and toggles resolved once before any run starts.
pub struct Resolved {
    pub config: AppConfig,
    pub toggles: FaultToggles,
}

pub(crate) fn resolve(
    command: &str,
    config_path: Option<&Path>,
    args: &ToggleArgs,
) -> Result<Resolved, CommandResult> {
    let config_failure = |message: String| {
        CommandResult::failure(command, "config_validation", message, EXIT_CONFIG)
    };

    let overrides = args.overrides().map_err(config_failure)?;
    let options = LoadOptions {
        config_path: config_path.map(PathBuf::from),
        require_file: config_path.is_some(),
        overrides,
    };
    let config = AppConfig::load(options)
        .map_err(|error| config_failure(format!("configuration issue: {error}")))?;
    let toggles = FaultToggles::from_config(&config.toggles)
        .map_err(|error| config_failure(format!("invalid toggles: {error}")))?;

    Ok(Resolved { config, toggles })
}

pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            EXIT_INTERNAL,
        )
    })
}

/// Raises the flag on Ctrl-C so in-flight runs stop at their next stage
/// boundary. Abort the handle once the runs are done.
pub(crate) fn spawn_interrupt_watcher(cancel: CancellationFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(
                event_name = "cli.interrupted",
                correlation_id = "cli",
                "interrupt received, cancelling at the next stage boundary"
            );
            cancel.cancel();
        }
    })
}

pub(crate) fn serialize_payload<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
