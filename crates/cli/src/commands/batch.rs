use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use opsdesk_agent::{CancellationFlag, DeskRuntime};
use opsdesk_core::audit::TracingAuditSink;
use opsdesk_core::clock::SystemClock;
use opsdesk_db::SCENARIOS;

use crate::commands::run::RunSummary;
use crate::commands::{
    build_runtime, resolve, serialize_payload, spawn_interrupt_watcher, CommandResult, Resolved,
    ToggleArgs, EXIT_ABORTED, EXIT_CANCELLED, EXIT_CONFIG, EXIT_INTERNAL, EXIT_OK,
};

const COMMAND: &str = "batch";

#[derive(Debug, Clone, Args)]
pub struct BatchArgs {
    #[arg(long, value_name = "A..B", help = "Half-open scenario index range, default all")]
    pub range: Option<String>,
    #[arg(long, default_value_t = 1, help = "Maximum runs in flight, 1 runs sequentially")]
    pub concurrency: usize,
    #[command(flatten)]
    pub toggles: ToggleArgs,
}

impl Default for BatchArgs {
    fn default() -> Self {
        Self { range: None, concurrency: 1, toggles: ToggleArgs::default() }
    }
}

#[derive(Debug, Default, Serialize)]
struct BatchReport {
    command: &'static str,
    status: &'static str,
    runs: usize,
    completed: usize,
    aborted: usize,
    cancelled: usize,
    simulated_failures: usize,
}

pub fn run(args: &BatchArgs, config_path: Option<&Path>) -> CommandResult {
    let resolved = match resolve(COMMAND, config_path, &args.toggles) {
        Ok(resolved) => resolved,
        Err(failure) => return failure,
    };
    let indices = match args.range.as_deref().map(|raw| parse_range(raw, SCENARIOS.len())) {
        None => 0..SCENARIOS.len(),
        Some(Ok(range)) => range,
        Some(Err(message)) => {
            return CommandResult::failure(COMMAND, "invalid_arguments", message, EXIT_CONFIG);
        }
    };
    if args.concurrency == 0 {
        return CommandResult::failure(
            COMMAND,
            "invalid_arguments",
            "concurrency must be at least 1",
            EXIT_CONFIG,
        );
    }

    crate::logging::init(&resolved.config.logging);

    let runtime = match build_runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    runtime.block_on(execute(resolved, indices, args.concurrency))
}

async fn execute(resolved: Resolved, indices: Range<usize>, concurrency: usize) -> CommandResult {
    let Resolved { config, toggles } = resolved;
    let seeded = DeskRuntime::seeded(&config, Arc::new(SystemClock), Arc::new(TracingAuditSink));
    let desk = match seeded.await {
        Ok(desk) => Arc::new(desk),
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
    let semaphore = Arc::new(Semaphore::new(concurrency));

    let mut runs = JoinSet::new();
    for (position, scenario) in SCENARIOS[indices].iter().enumerate() {
        let desk = desk.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let toggles = toggles.clone();
        runs.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let outcome = desk.run_scenario(scenario, toggles, &cancel).await;
            (position, RunSummary::new(COMMAND, scenario, &outcome))
        });
    }

    let mut report = BatchReport { command: COMMAND, ..BatchReport::default() };
    let mut summaries = Vec::with_capacity(runs.len());
    while let Some(joined) = runs.join_next().await {
        report.runs += 1;
        match joined {
            Ok((position, summary)) => {
                report.simulated_failures += summary.simulated_failures;
                match summary.status {
                    "audited" => report.completed += 1,
                    "cancelled" => report.cancelled += 1,
                    _ => report.aborted += 1,
                }
                summaries.push((position, summary));
            }
            Err(error) => {
                report.aborted += 1;
                tracing::error!(
                    event_name = "cli.batch.task_failed",
                    correlation_id = "cli",
                    error = %error,
                    "batch task did not complete"
                );
            }
        }
    }
    watcher.abort();

    let exit_code = if report.aborted > 0 {
        EXIT_ABORTED
    } else if report.cancelled > 0 {
        EXIT_CANCELLED
    } else {
        EXIT_OK
    };
    report.status = if exit_code == EXIT_OK { "ok" } else { "partial" };

    summaries.sort_by_key(|(position, _)| *position);
    let mut lines: Vec<String> =
        summaries.iter().map(|(_, summary)| serialize_payload(summary)).collect();
    lines.push(serialize_payload(&report));

    CommandResult { exit_code, output: lines.join("\n") }
}

/// Parses `A..B`, `A..` or `..B` against a catalog of `len` scenarios.
fn parse_range(raw: &str, len: usize) -> Result<Range<usize>, String> {
    let invalid = || format!("invalid range `{raw}`, expected A..B");
    let (start, end) = raw.trim().split_once("..").ok_or_else(invalid)?;

    let start = match start.trim() {
        "" => 0,
        value => value.parse::<usize>().map_err(|_| invalid())?,
    };
    let end = match end.trim() {
        "" => len,
        value => value.parse::<usize>().map_err(|_| invalid())?,
    };

    if start >= end {
        return Err(format!("range `{raw}` is empty"));
    }
    if end > len {
        return Err(format!("range `{raw}` exceeds the {len} available scenarios"));
    }
    Ok(start..end)
}
