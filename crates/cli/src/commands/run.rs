use std::path::Path;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;

use opsdesk_agent::{CancellationFlag, DeskRuntime};
use opsdesk_core::audit::TracingAuditSink;
use opsdesk_core::clock::SystemClock;
use opsdesk_core::context::RequestContext;
use opsdesk_core::pipeline::TerminalFailure;
use opsdesk_db::fixtures::{scenario, scenario_by_name};
use opsdesk_db::Scenario;

use crate::commands::{
    build_runtime, resolve, serialize_payload, spawn_interrupt_watcher, CommandResult, Resolved,
    ToggleArgs, EXIT_ABORTED, EXIT_CANCELLED, EXIT_CONFIG, EXIT_INTERNAL, EXIT_OK,
};

const COMMAND: &str = "run";

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    #[arg(long, conflicts_with = "scenario", help = "Scenario index from `opsdesk scenarios`")]
    pub index: Option<usize>,
    #[arg(long, help = "Scenario name from `opsdesk scenarios`")]
    pub scenario: Option<String>,
    #[command(flatten)]
    pub toggles: ToggleArgs,
}

pub fn run(args: &RunArgs, config_path: Option<&Path>) -> CommandResult {
    let resolved = match resolve(COMMAND, config_path, &args.toggles) {
        Ok(resolved) => resolved,
        Err(failure) => return failure,
    };
    let selected = match select_scenario(args) {
        Ok(selected) => selected,
        Err(message) => {
            return CommandResult::failure(COMMAND, "invalid_arguments", message, EXIT_CONFIG);
        }
    };

    crate::logging::init(&resolved.config.logging);

    let runtime = match build_runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    runtime.block_on(execute(resolved, selected))
}

async fn execute(resolved: Resolved, selected: &'static Scenario) -> CommandResult {
    let Resolved { config, toggles } = resolved;
    let seeded = DeskRuntime::seeded(&config, Arc::new(SystemClock), Arc::new(TracingAuditSink));
    let desk = match seeded.await {
        Ok(desk) => desk,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "runtime_init",
                format!("failed to prepare pipeline: {error:#}"),
                EXIT_INTERNAL,
            );
        }
    };

    let cancel = CancellationFlag::new();
    let watcher = spawn_interrupt_watcher(cancel.clone());
    let outcome = desk.run_scenario(selected, toggles, &cancel).await;
    watcher.abort();

    let mut lines = Vec::new();
    match &outcome {
        Ok(ctx) => {
            if let Some(audit) = ctx.audit() {
                lines.push(audit.rationale.clone());
            }
        }
        Err(failure) => lines.push(failure.to_string()),
    }
    lines.push(serialize_payload(&RunSummary::new(COMMAND, selected, &outcome)));

    CommandResult { exit_code: exit_code_for(&outcome), output: lines.join("\n") }
}

fn select_scenario(args: &RunArgs) -> Result<&'static Scenario, String> {
    if let Some(name) = args.scenario.as_deref() {
        return scenario_by_name(name).ok_or_else(|| format!("unknown scenario `{name}`"));
    }
    let index = args.index.unwrap_or(0);
    scenario(index).ok_or_else(|| format!("scenario index {index} is out of range"))
}

pub(crate) fn exit_code_for(outcome: &Result<RequestContext, TerminalFailure>) -> u8 {
    match outcome {
        Ok(_) => EXIT_OK,
        Err(failure) if failure.is_cancelled() => EXIT_CANCELLED,
        Err(_) => EXIT_ABORTED,
    }
}

/// One JSON line per pipeline run.
#[derive(Debug, Serialize)]
pub(crate) struct RunSummary {
    pub command: &'static str,
    pub status: &'static str,
    pub scenario: &'static str,
    pub request_id: String,
    pub user_id: String,
    pub terminal_state: &'static str,
    pub last_state: Option<&'static str>,
    pub intent: Option<&'static str>,
    pub sentiment: Option<&'static str>,
    pub decision: Option<&'static str>,
    pub tools: Vec<&'static str>,
    pub failed_tools: Vec<&'static str>,
    pub simulated_failures: usize,
    pub resolution: Option<&'static str>,
    pub degradations: Vec<String>,
    pub error: Option<String>,
}

impl RunSummary {
    pub(crate) fn new(
        command: &'static str,
        scenario: &Scenario,
        outcome: &Result<RequestContext, TerminalFailure>,
    ) -> Self {
        let (ctx, status, last_state, error) = match outcome {
            Ok(ctx) => (ctx, "audited", None, None),
            Err(failure) => (
                failure.context.as_ref(),
                if failure.is_cancelled() { "cancelled" } else { "aborted" },
                Some(failure.last_state.as_str()),
                failure.failure().map(ToString::to_string),
            ),
        };
        let action = ctx.action();

        Self {
            command,
            status,
            scenario: scenario.name,
            request_id: ctx.request_id().to_string(),
            user_id: ctx.user_id().to_string(),
            terminal_state: terminal_state(outcome),
            last_state,
            intent: ctx.intent().map(|intent| intent.as_str()),
            sentiment: ctx.sentiment().map(|sentiment| sentiment.as_str()),
            decision: action
                .and_then(|action| action.decision.as_ref())
                .map(|decision| decision.label()),
            tools: action
                .map(|action| action.invoked_tools().iter().map(|tool| tool.as_str()).collect())
                .unwrap_or_default(),
            failed_tools: action
                .map(|action| {
                    action.failed_receipts().map(|receipt| receipt.tool.as_str()).collect()
                })
                .unwrap_or_default(),
            simulated_failures: action.map(|action| action.simulated_failure_count()).unwrap_or(0),
            resolution: action.map(|action| action.resolution.as_str()),
            degradations: ctx.audit().map(|audit| audit.degradations.clone()).unwrap_or_default(),
            error,
        }
    }
}

/// A cancelled run closes its context as aborted; the summary keeps the two apart.
fn terminal_state(outcome: &Result<RequestContext, TerminalFailure>) -> &'static str {
    match outcome {
        Ok(ctx) => ctx.state().as_str(),
        Err(failure) if failure.is_cancelled() => "cancelled",
        Err(failure) => failure.context.state().as_str(),
    }
}
