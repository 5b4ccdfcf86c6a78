use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use opsdesk_core::context::{PolicySet, RequestContext};
use opsdesk_core::domain::policy::ScoredPolicy;
use opsdesk_core::errors::StageFailure;
use opsdesk_core::pipeline::Stage;
use opsdesk_core::text;
use opsdesk_db::PolicyStore;

use crate::stage::{bounded, Agent};

/// A1: retrieves the policies that govern the request.
pub struct PolicyAgent {
    store: Arc<dyn PolicyStore>,
    top_k: usize,
    leaf_timeout: Duration,
}

impl PolicyAgent {
    pub fn new(store: Arc<dyn PolicyStore>, top_k: usize, leaf_timeout: Duration) -> Self {
        Self { store, top_k, leaf_timeout }
    }
}

/// Lowercased content tokens of the request, first occurrence order.
pub fn build_query(query_text: &str) -> String {
    text::content_tokens(query_text).join(" ")
}

/// Applies the retrieval rule to store candidates.
///
/// Without drift only policies active at `as_of` survive, ordered by
/// relevance and then by the newest `effective_from`. With drift the single
/// most relevant candidate is kept whether or not it is still in force.
pub fn select_policies(
    mut candidates: Vec<ScoredPolicy>,
    as_of: DateTime<Utc>,
    drift: bool,
) -> Vec<ScoredPolicy> {
    if drift {
        candidates.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
        candidates.truncate(1);
        return candidates;
    }

    candidates.retain(|candidate| candidate.policy.is_active_at(as_of));
    candidates.sort_by(|left, right| {
        right
            .relevance
            .total_cmp(&left.relevance)
            .then_with(|| right.policy.effective_from.cmp(&left.policy.effective_from))
    });
    candidates
}

#[async_trait]
impl Agent for PolicyAgent {
    type Output = PolicySet;

    fn stage(&self) -> Stage {
        Stage::Policy
    }

    async fn run(&self, ctx: &RequestContext) -> Result<PolicySet, StageFailure> {
        let drift = ctx.toggles().policy_drift;
        let query = build_query(ctx.query_text());
        if query.is_empty() {
            return Ok(PolicySet { query, drift_applied: drift, ..PolicySet::default() });
        }

        let as_of = (!drift).then(|| ctx.as_of());
        let candidates = bounded(self.leaf_timeout, self.store.search(&query, as_of, self.top_k))
            .await
            .ok_or_else(|| {
                StageFailure::recoverable(
                    Stage::Policy,
                    format!("policy search timed out after {}ms", self.leaf_timeout.as_millis()),
                )
            })?
            .map_err(|error| StageFailure::recoverable(Stage::Policy, error.to_string()))?;

        let candidate_count = candidates.len();
        let policies = select_policies(candidates, ctx.as_of(), drift);

        tracing::debug!(
            event_name = "policy.search.completed",
            correlation_id = %ctx.request_id(),
            query = %query,
            candidate_count,
            selected = policies.len(),
            drift,
            "policy candidates filtered"
        );

        Ok(PolicySet { query, policies, drift_applied: drift, degraded: None })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use opsdesk_core::context::RequestContext;
    use opsdesk_core::domain::customer::UserId;
    use opsdesk_core::domain::policy::{Policy, PolicyId, Region, ScoredPolicy};
    use opsdesk_core::errors::FailureKind;
    use opsdesk_core::toggles::{FaultToggles, ToggleName};
    use opsdesk_db::{InMemoryPolicyStore, InMemoryRecordsStore, SeedDataset};

    use super::{build_query, select_policies, PolicyAgent};
    use crate::stage::Agent;

    fn scored(
        id: &str,
        relevance: f32,
        from_days_ago: i64,
        until_days_ago: Option<i64>,
    ) -> ScoredPolicy {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid date");
        ScoredPolicy {
            policy: Policy {
                id: PolicyId(id.to_string()),
                title: id.to_string(),
                text: String::new(),
                region: Region::Us,
                version: id.to_string(),
                effective_from: now - ChronoDuration::days(from_days_ago),
                effective_until: until_days_ago.map(|days| now - ChronoDuration::days(days)),
                refund_window_days: 30,
                excluded_categories: Vec::new(),
            },
            relevance,
        }
    }

    async fn seeded_store() -> Arc<InMemoryPolicyStore> {
        let store = Arc::new(InMemoryPolicyStore::default());
        let records = InMemoryRecordsStore::default();
        SeedDataset::build(Utc::now()).load_into(&store, &records).await.expect("seed");
        store
    }

    fn context(query: &str, toggles: FaultToggles) -> RequestContext {
        RequestContext::new(UserId::new("user_001"), query, toggles, Utc::now())
    }

    #[test]
    fn query_drops_stop_words_and_duplicates() {
        assert_eq!(
            build_query("I need a REFUND, a refund for my earbuds!"),
            "need refund earbuds"
        );
        assert_eq!(build_query("  ?! "), "");
    }

    #[test]
    fn selection_without_drift_filters_expired_and_breaks_ties_by_recency() {
        let as_of = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid date");
        let selected = select_policies(
            vec![
                scored("older", 0.5, 300, None),
                scored("expired", 0.9, 500, Some(10)),
                scored("newer", 0.5, 100, None),
                scored("best", 0.7, 200, None),
            ],
            as_of,
            false,
        );

        let ids: Vec<&str> = selected.iter().map(|hit| hit.policy.id.0.as_str()).collect();
        assert_eq!(ids, vec!["best", "newer", "older"]);
    }

    #[test]
    fn selection_with_drift_keeps_single_top_candidate_even_if_expired() {
        let as_of = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid date");
        let selected = select_policies(
            vec![scored("current", 0.4, 100, None), scored("expired", 0.9, 500, Some(10))],
            as_of,
            true,
        );

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].policy.id.0, "expired");
        assert!(!selected[0].policy.is_active_at(as_of));
    }

    #[tokio::test]
    async fn run_is_idempotent_for_the_same_instant() {
        let agent = PolicyAgent::new(seeded_store().await, 10, Duration::from_secs(1));
        let ctx = context(
            "I need a refund for my bluetooth electronics purchase",
            FaultToggles::default(),
        );

        let first = agent.run(&ctx).await.expect("first run");
        let second = agent.run(&ctx).await.expect("second run");

        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert!(first.policies.iter().all(|hit| hit.policy.is_active_at(ctx.as_of())));
    }

    #[tokio::test]
    async fn drift_returns_the_stale_final_sale_policy() {
        let agent = PolicyAgent::new(seeded_store().await, 10, Duration::from_secs(1));
        let ctx = context(
            "I need a refund for my bluetooth electronics purchase, I don't like the product",
            FaultToggles::default().enable(ToggleName::Drift),
        );

        let policies = agent.run(&ctx).await.expect("run");

        assert!(policies.drift_applied);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies.policies[0].policy.id.0, "pol-us-v23.0");
        assert!(!policies.policies[0].policy.is_active_at(ctx.as_of()));
    }

    #[tokio::test]
    async fn empty_query_skips_the_store() {
        let store = seeded_store().await;
        store.set_available(false);
        let agent = PolicyAgent::new(store, 10, Duration::from_secs(1));

        let policies = agent.run(&context("!!!", FaultToggles::default())).await.expect("run");
        assert!(policies.is_empty());
        assert!(policies.degraded.is_none());
    }

    #[tokio::test]
    async fn unavailable_store_is_recoverable() {
        let store = seeded_store().await;
        store.set_available(false);
        let agent = PolicyAgent::new(store, 10, Duration::from_secs(1));

        let failure = agent
            .run(&context("refund please", FaultToggles::default()))
            .await
            .expect_err("store is down");
        assert_eq!(failure.kind, FailureKind::Recoverable);
        assert!(failure.reason.contains("not reachable"));
    }
}
