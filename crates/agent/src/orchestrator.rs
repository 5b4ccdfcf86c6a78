use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opsdesk_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use opsdesk_core::clock::Clock;
use opsdesk_core::config::PipelineConfig;
use opsdesk_core::context::{Degradable, RequestContext};
use opsdesk_core::domain::customer::UserId;
use opsdesk_core::errors::{ContextError, FailureKind, StageFailure};
use opsdesk_core::pipeline::{Stage, TerminalFailure, TerminationReason};
use opsdesk_core::toggles::FaultToggles;
use opsdesk_db::{PolicyStore, RecordsStore};

use crate::action::ActionAgent;
use crate::audit::AuditAgent;
use crate::classifier::{Classifier, FixedClassifier};
use crate::policy::PolicyAgent;
use crate::records::{RecordLimits, RecordsAgent};
use crate::stage::{elapsed_ms, Agent};
use crate::tools::{FaultInjectingExecutor, ToolExecutor};

const ACTOR: &str = "orchestrator";

/// Raised by the caller to stop a run at the next stage boundary.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunRequest {
    pub user_id: UserId,
    pub query_text: String,
    pub toggles: FaultToggles,
}

impl RunRequest {
    pub fn new(user_id: UserId, query_text: impl Into<String>, toggles: FaultToggles) -> Self {
        Self { user_id, query_text: query_text.into(), toggles }
    }
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct PipelineDeps {
    pub policy_store: Arc<dyn PolicyStore>,
    pub records_store: Arc<dyn RecordsStore>,
    pub classifier: Arc<dyn Classifier>,
    pub tools: Arc<dyn ToolExecutor>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

/// Runs A1, A3, A5 and A7 in order over one append-only context.
///
/// Recoverable stage failures are replaced by a flagged placeholder and the
/// run continues; fatal failures and cancellation end the run with a
/// [`TerminalFailure`] carrying the partial context. Nothing is retried here.
pub struct Orchestrator {
    deps: PipelineDeps,
    policy_agent: PolicyAgent,
    records_agent: RecordsAgent,
    audit_agent: AuditAgent,
    leaf_timeout: Duration,
}

impl Orchestrator {
    pub fn new(deps: PipelineDeps, config: &PipelineConfig) -> Self {
        let leaf_timeout = Duration::from_millis(config.leaf_timeout_ms);
        Self {
            policy_agent: PolicyAgent::new(
                deps.policy_store.clone(),
                config.policy_top_k,
                leaf_timeout,
            ),
            records_agent: RecordsAgent::new(
                deps.records_store.clone(),
                RecordLimits::from_config(config),
                leaf_timeout,
            ),
            audit_agent: AuditAgent,
            leaf_timeout,
            deps,
        }
    }

    pub async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationFlag,
    ) -> Result<RequestContext, TerminalFailure> {
        let RunRequest { user_id, query_text, toggles } = request;
        let ctx = RequestContext::new(user_id, query_text, toggles, self.deps.clock.now());

        tracing::info!(
            event_name = "pipeline.run.started",
            correlation_id = %ctx.request_id(),
            user_id = %ctx.user_id(),
            toggles = ?ctx.toggles().active_names(),
            "pipeline run started"
        );

        let ctx = self.checkpoint(ctx, cancel)?;
        let ctx = self.advance(ctx, &self.policy_agent, RequestContext::commit_policies).await?;

        let ctx = self.checkpoint(ctx, cancel)?;
        let ctx = self.advance(ctx, &self.records_agent, RequestContext::commit_records).await?;

        let ctx = self.checkpoint(ctx, cancel)?;
        let action_agent = self.action_agent_for(ctx.toggles(), ctx.user_id());
        let ctx = self.advance(ctx, &action_agent, RequestContext::commit_action).await?;

        let mut ctx = self.checkpoint(ctx, cancel)?;
        let started = Instant::now();
        let audit = match self.audit_agent.run(&ctx).await {
            Ok(audit) => audit,
            Err(failure) => return Err(self.abort(ctx, TerminationReason::Error { failure })),
        };
        let resolution = audit.resolution;
        let degraded = audit.is_degraded();
        if let Err(error) = ctx.commit_audit(audit) {
            return Err(self.fail_commit(ctx, Stage::Audit, error));
        }
        ctx.record_timing(Stage::Audit, elapsed_ms(started));
        self.stage_completed(&ctx, Stage::Audit);

        tracing::info!(
            event_name = "pipeline.run.completed",
            correlation_id = %ctx.request_id(),
            user_id = %ctx.user_id(),
            resolution = resolution.as_str(),
            degraded,
            "pipeline run audited"
        );
        self.deps.audit_sink.emit(
            self.event(
                &ctx,
                "pipeline.run.completed",
                AuditCategory::Pipeline,
                ACTOR,
                if degraded { AuditOutcome::Degraded } else { AuditOutcome::Success },
            )
            .with_metadata("resolution", resolution.as_str()),
        );
        Ok(ctx)
    }

    /// Picks this run's classifier and tool executor from its toggles.
    fn action_agent_for(&self, toggles: &FaultToggles, user_id: &UserId) -> ActionAgent {
        let classifier: Arc<dyn Classifier> = if toggles.substitutes_classification_for(user_id) {
            Arc::new(FixedClassifier::default())
        } else {
            self.deps.classifier.clone()
        };

        let executor: Arc<dyn ToolExecutor> = if toggles.api_error_rate.is_zero() {
            self.deps.tools.clone()
        } else {
            Arc::new(FaultInjectingExecutor::new(
                self.deps.tools.clone(),
                toggles.api_error_rate,
                toggles.seed,
            ))
        };

        ActionAgent::new(classifier, executor, self.leaf_timeout)
    }

    async fn advance<A>(
        &self,
        mut ctx: RequestContext,
        agent: &A,
        commit: fn(&mut RequestContext, A::Output) -> Result<(), ContextError>,
    ) -> Result<RequestContext, TerminalFailure>
    where
        A: Agent,
        A::Output: Degradable,
    {
        let stage = agent.stage();
        let started = Instant::now();

        let output = match agent.run(&ctx).await {
            Ok(output) => output,
            Err(failure) if failure.kind == FailureKind::Recoverable => {
                self.stage_degraded(&ctx, &failure);
                A::Output::placeholder(failure.reason)
            }
            Err(failure) => return Err(self.abort(ctx, TerminationReason::Error { failure })),
        };

        if let Err(error) = commit(&mut ctx, output) {
            return Err(self.fail_commit(ctx, stage, error));
        }
        ctx.record_timing(stage, elapsed_ms(started));
        self.stage_completed(&ctx, stage);
        Ok(ctx)
    }

    fn checkpoint(
        &self,
        ctx: RequestContext,
        cancel: &CancellationFlag,
    ) -> Result<RequestContext, TerminalFailure> {
        if cancel.is_cancelled() {
            return Err(self.abort(ctx, TerminationReason::Cancelled));
        }
        Ok(ctx)
    }

    fn fail_commit(
        &self,
        ctx: RequestContext,
        stage: Stage,
        error: ContextError,
    ) -> TerminalFailure {
        self.abort(ctx, TerminationReason::Error { failure: error.into_stage_failure(stage) })
    }

    fn abort(&self, mut ctx: RequestContext, reason: TerminationReason) -> TerminalFailure {
        let last_state = ctx.abort().unwrap_or_else(|_| ctx.state());

        match &reason {
            TerminationReason::Cancelled => {
                tracing::warn!(
                    event_name = "pipeline.run.cancelled",
                    correlation_id = %ctx.request_id(),
                    user_id = %ctx.user_id(),
                    last_state = last_state.as_str(),
                    "pipeline run cancelled"
                );
                self.deps.audit_sink.emit(
                    self.event(
                        &ctx,
                        "pipeline.run.cancelled",
                        AuditCategory::Pipeline,
                        ACTOR,
                        AuditOutcome::Cancelled,
                    )
                    .with_metadata("last_state", last_state.as_str()),
                );
            }
            TerminationReason::Error { failure } => {
                tracing::error!(
                    event_name = "pipeline.run.aborted",
                    correlation_id = %ctx.request_id(),
                    user_id = %ctx.user_id(),
                    stage = failure.stage.as_str(),
                    last_state = last_state.as_str(),
                    reason = %failure.reason,
                    "pipeline run aborted"
                );
                self.deps.audit_sink.emit(
                    self.event(
                        &ctx,
                        "pipeline.run.aborted",
                        category_for(failure.stage),
                        ACTOR,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("stage", failure.stage.as_str())
                    .with_metadata("last_state", last_state.as_str())
                    .with_metadata("reason", failure.reason.clone()),
                );
            }
        }

        TerminalFailure { last_state, reason, context: Box::new(ctx) }
    }

    fn stage_completed(&self, ctx: &RequestContext, stage: Stage) {
        tracing::info!(
            event_name = "pipeline.stage.completed",
            correlation_id = %ctx.request_id(),
            user_id = %ctx.user_id(),
            stage = stage.as_str(),
            agent = stage.agent_code(),
            state = ctx.state().as_str(),
            "stage completed"
        );
        self.deps.audit_sink.emit(
            self.event(
                ctx,
                "pipeline.stage.completed",
                category_for(stage),
                stage.agent_code(),
                AuditOutcome::Success,
            )
            .with_metadata("stage", stage.as_str()),
        );
    }

    fn stage_degraded(&self, ctx: &RequestContext, failure: &StageFailure) {
        tracing::warn!(
            event_name = "pipeline.stage.degraded",
            correlation_id = %ctx.request_id(),
            user_id = %ctx.user_id(),
            stage = failure.stage.as_str(),
            reason = %failure.reason,
            "stage degraded, continuing with placeholder"
        );
        self.deps.audit_sink.emit(
            self.event(
                ctx,
                "pipeline.stage.degraded",
                category_for(failure.stage),
                failure.stage.agent_code(),
                AuditOutcome::Degraded,
            )
            .with_metadata("stage", failure.stage.as_str())
            .with_metadata("reason", failure.reason.clone()),
        );
    }

    fn event(
        &self,
        ctx: &RequestContext,
        event_type: &str,
        category: AuditCategory,
        actor: &str,
        outcome: AuditOutcome,
    ) -> AuditEvent {
        AuditEvent::new(
            ctx.request_id(),
            Some(ctx.user_id().clone()),
            event_type,
            category,
            actor,
            outcome,
        )
        .with_metadata("state", ctx.state().as_str())
    }
}

fn category_for(stage: Stage) -> AuditCategory {
    match stage {
        Stage::Policy => AuditCategory::Policy,
        Stage::Records => AuditCategory::Records,
        Stage::Action => AuditCategory::Action,
        Stage::Audit => AuditCategory::Audit,
    }
}

#[cfg(test)]
mod tests {
    use super::CancellationFlag;

    #[test]
    fn cancellation_flag_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());

        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
