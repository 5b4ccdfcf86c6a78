use std::sync::Arc;

use anyhow::{Context, Result};

use opsdesk_core::audit::AuditSink;
use opsdesk_core::clock::Clock;
use opsdesk_core::config::{AppConfig, PipelineConfig};
use opsdesk_core::context::RequestContext;
use opsdesk_core::domain::customer::UserId;
use opsdesk_core::pipeline::TerminalFailure;
use opsdesk_core::toggles::FaultToggles;
use opsdesk_db::fixtures::SeedSummary;
use opsdesk_db::{InMemoryPolicyStore, InMemoryRecordsStore, Scenario, SeedDataset};

use crate::classifier::{classifier_from_config, Classifier};
use crate::orchestrator::{CancellationFlag, Orchestrator, PipelineDeps, RunRequest};
use crate::tools::ToolRegistry;

/// An orchestrator over freshly seeded in-memory stores. Used by the operator
/// runner and by integration tests.
pub struct DeskRuntime {
    orchestrator: Orchestrator,
    policy_store: Arc<InMemoryPolicyStore>,
    records_store: Arc<InMemoryRecordsStore>,
    seed: SeedSummary,
}

impl DeskRuntime {
    pub async fn seeded(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let classifier = classifier_from_config(&config.llm)?;
        Self::seeded_with(&config.pipeline, classifier, clock, audit_sink).await
    }

    pub async fn seeded_with(
        pipeline: &PipelineConfig,
        classifier: Arc<dyn Classifier>,
        clock: Arc<dyn Clock>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let policy_store = Arc::new(InMemoryPolicyStore::default());
        let records_store = Arc::new(InMemoryRecordsStore::default());
        let seed = SeedDataset::build(clock.now())
            .load_into(&policy_store, &records_store)
            .await
            .context("failed to seed in-memory stores")?;

        let tools = ToolRegistry::with_records(records_store.clone(), clock.clone());
        let deps = PipelineDeps {
            policy_store: policy_store.clone(),
            records_store: records_store.clone(),
            classifier,
            tools: Arc::new(tools),
            audit_sink,
            clock,
        };

        tracing::debug!(
            event_name = "runtime.seeded",
            policies = seed.policies,
            orders = seed.orders,
            refund_requests = seed.refund_requests,
            tickets = seed.tickets,
            "in-memory stores seeded"
        );

        Ok(Self {
            orchestrator: Orchestrator::new(deps, pipeline),
            policy_store,
            records_store,
            seed,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn policy_store(&self) -> &Arc<InMemoryPolicyStore> {
        &self.policy_store
    }

    pub fn records_store(&self) -> &Arc<InMemoryRecordsStore> {
        &self.records_store
    }

    pub fn seed_summary(&self) -> SeedSummary {
        self.seed
    }

    pub async fn run_scenario(
        &self,
        scenario: &Scenario,
        toggles: FaultToggles,
        cancel: &CancellationFlag,
    ) -> Result<RequestContext, TerminalFailure> {
        let request = RunRequest::new(UserId::new(scenario.user_id), scenario.query, toggles);
        self.orchestrator.run(request, cancel).await
    }
}
