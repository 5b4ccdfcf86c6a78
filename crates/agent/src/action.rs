use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use opsdesk_core::action::{
    ActionOutcome, RefundDecision, Resolution, ToolCall, ToolFailure, ToolName, ToolOutcome,
    ToolReceipt,
};
use opsdesk_core::context::{PolicySet, RequestContext, UserRecords};
use opsdesk_core::domain::classification::{Classification, Intent, Sentiment};
use opsdesk_core::errors::StageFailure;
use opsdesk_core::pipeline::Stage;

use crate::classifier::{Classifier, ClassifierError};
use crate::eligibility;
use crate::stage::{bounded, elapsed_ms, Agent};
use crate::tools::ToolExecutor;

const SUMMARY_LIMIT: usize = 120;

/// A5: classifies the request, decides what to do and does it through the
/// tool executor. Built per run so the orchestrator can swap the classifier
/// and decorate the executor.
pub struct ActionAgent {
    classifier: Arc<dyn Classifier>,
    executor: Arc<dyn ToolExecutor>,
    leaf_timeout: Duration,
}

impl ActionAgent {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        executor: Arc<dyn ToolExecutor>,
        leaf_timeout: Duration,
    ) -> Self {
        Self { classifier, executor, leaf_timeout }
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let limit_ms = u64::try_from(self.leaf_timeout.as_millis()).unwrap_or(u64::MAX);
        bounded(self.leaf_timeout, self.classifier.classify(text))
            .await
            .unwrap_or(Err(ClassifierError::Timeout(limit_ms)))
    }

    async fn invoke(&self, call: ToolCall) -> ToolReceipt {
        let started = Instant::now();
        let tool = call.tool;
        let args = call.args.clone();

        let outcome = match bounded(self.leaf_timeout, self.executor.invoke(call)).await {
            Some(Ok(response)) => ToolOutcome::Succeeded { response },
            Some(Err(failure)) => ToolOutcome::Failed { failure },
            None => ToolOutcome::Failed {
                failure: ToolFailure::recoverable(
                    tool,
                    format!("timed out after {}ms", self.leaf_timeout.as_millis()),
                ),
            },
        };

        ToolReceipt { tool, args, outcome, latency_ms: elapsed_ms(started) }
    }
}

/// The tool calls for a classified request, in invocation order.
pub fn plan_tools(
    ctx: &RequestContext,
    records: &UserRecords,
    classification: &Classification,
    decision: Option<&RefundDecision>,
) -> Vec<ToolCall> {
    let user_id = ctx.user_id().as_str();
    let query = ctx.query_text();
    let order_id = match decision.and_then(RefundDecision::order_id) {
        Some(order_id) => Some(order_id.0.clone()),
        None => eligibility::relevant_order(&records.orders, query)
            .map(|order| order.order_id.0.clone()),
    };

    let ticket = ToolCall::new(
        ToolName::CreateOrUpdateTicket,
        json!({
            "user_id": user_id,
            "order_id": order_id,
            "sentiment": classification.sentiment,
            "summary": format!(
                "{}: {}",
                classification.intent.as_str(),
                truncate(query, SUMMARY_LIMIT)
            ),
        }),
    );
    let escalate = |reason: &str| {
        ToolCall::new(
            ToolName::EscalateTicket,
            json!({
                "user_id": user_id,
                "order_id": order_id,
                "sentiment": classification.sentiment,
                "reason": reason,
            }),
        )
    };

    let mut plan = match (classification.intent, decision) {
        (Intent::Refund, Some(RefundDecision::Eligible { order_id, .. })) => vec![
            ToolCall::new(
                ToolName::CreateRefundRequest,
                json!({
                    "user_id": user_id,
                    "order_id": order_id.0,
                    "reason": truncate(query, SUMMARY_LIMIT),
                }),
            ),
            ticket,
        ],
        (Intent::Refund, Some(RefundDecision::Ineligible { order_id, reasons, .. })) => vec![
            ToolCall::new(
                ToolName::ExplainRefundStatus,
                json!({
                    "user_id": user_id,
                    "order_id": order_id.0,
                    "denial_reasons": reasons,
                }),
            ),
            ticket,
        ],
        (Intent::Refund, Some(RefundDecision::NeedsHumanReview { reason })) => {
            vec![escalate(reason), ticket]
        }
        (Intent::Refund, None) => {
            vec![escalate("refund requested without an eligibility decision"), ticket]
        }
        (Intent::Inquiry, _) if !records.refund_requests.is_empty() => vec![
            ToolCall::new(
                ToolName::ExplainRefundStatus,
                json!({ "user_id": user_id, "order_id": order_id }),
            ),
            ticket,
        ],
        (Intent::Inquiry, _) => vec![
            ToolCall::new(
                ToolName::ExplainOrderStatus,
                json!({ "user_id": user_id, "order_id": order_id }),
            ),
            ticket,
        ],
        (Intent::General, _) => vec![ticket],
    };

    if classification.sentiment == Sentiment::Negative
        && !plan.iter().any(|call| call.tool == ToolName::EscalateTicket)
    {
        plan.push(escalate("negative customer sentiment"));
    }

    plan
}

/// Picks the resolution from what actually succeeded, highest priority first.
pub fn resolve(decision: Option<&RefundDecision>, receipts: &[ToolReceipt]) -> Resolution {
    if receipts.is_empty() {
        return Resolution::NoActionRequired;
    }

    let succeeded = |tool: ToolName| {
        receipts.iter().find(|receipt| receipt.tool == tool && receipt.succeeded())
    };
    let needs_review = matches!(decision, Some(RefundDecision::NeedsHumanReview { .. }));

    if succeeded(ToolName::CreateRefundRequest).is_some() {
        Resolution::RefundRequestCreated
    } else if succeeded(ToolName::EscalateTicket).is_some() && needs_review {
        Resolution::EscalatedForReview
    } else if succeeded(ToolName::EscalateTicket).is_some() {
        Resolution::TicketEscalated
    } else if let Some(receipt) = succeeded(ToolName::CreateOrUpdateTicket) {
        let updated = receipt
            .response()
            .and_then(|response| response.get("operation"))
            .and_then(Value::as_str)
            == Some("updated");
        if updated {
            Resolution::TicketUpdated
        } else {
            Resolution::TicketCreated
        }
    } else if succeeded(ToolName::ExplainRefundStatus).is_some() {
        Resolution::RefundStatusExplained
    } else if succeeded(ToolName::ExplainOrderStatus).is_some() {
        Resolution::OrderStatusExplained
    } else {
        Resolution::ActionFailed
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}

fn required<'a, T>(value: Option<&'a T>, field: &str) -> Result<&'a T, StageFailure> {
    value.ok_or_else(|| {
        StageFailure::fatal(Stage::Action, format!("context is missing `{field}`"))
    })
}

#[async_trait]
impl Agent for ActionAgent {
    type Output = ActionOutcome;

    fn stage(&self) -> Stage {
        Stage::Action
    }

    async fn run(&self, ctx: &RequestContext) -> Result<ActionOutcome, StageFailure> {
        let policies: &PolicySet = required(ctx.policies(), "policies")?;
        let records: &UserRecords = required(ctx.records(), "records")?;

        let (classification, degraded) = match self.classify(ctx.query_text()).await {
            Ok(classification) => (classification, None),
            Err(error) => {
                tracing::warn!(
                    event_name = "classifier.fallback",
                    correlation_id = %ctx.request_id(),
                    classifier = self.classifier.name(),
                    error = %error,
                    "classification failed, using fallback labels"
                );
                (Classification::fallback(), Some(error.to_string()))
            }
        };

        let decision = (classification.intent == Intent::Refund)
            .then(|| eligibility::evaluate(policies, records, ctx.query_text(), ctx.as_of()));

        let plan = plan_tools(ctx, records, &classification, decision.as_ref());
        let planned: Vec<ToolName> = plan.iter().map(|call| call.tool).collect();

        let mut receipts = Vec::with_capacity(plan.len());
        for call in plan {
            let receipt = self.invoke(call).await;
            if let Some(failure) = receipt.failure() {
                tracing::warn!(
                    event_name = "tool.invocation.failed",
                    correlation_id = %ctx.request_id(),
                    tool = receipt.tool.as_str(),
                    injected = failure.injected,
                    reason = %failure.reason,
                    "tool call failed"
                );
            } else {
                tracing::debug!(
                    event_name = "tool.invocation.succeeded",
                    correlation_id = %ctx.request_id(),
                    tool = receipt.tool.as_str(),
                    latency_ms = receipt.latency_ms,
                    "tool call succeeded"
                );
            }
            receipts.push(receipt);
        }

        let resolution = resolve(decision.as_ref(), &receipts);
        Ok(ActionOutcome { classification, decision, planned, receipts, resolution, degraded })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};

    use opsdesk_core::action::{
        RefundDecision, Resolution, ToolCall, ToolFailure, ToolName, ToolOutcome, ToolReceipt,
    };
    use opsdesk_core::context::{PolicySet, RequestContext, UserRecords};
    use opsdesk_core::domain::classification::{
        Classification, ClassificationSource, Intent, Sentiment,
    };
    use opsdesk_core::domain::customer::UserId;
    use opsdesk_core::domain::order::OrderId;
    use opsdesk_core::domain::policy::PolicyId;
    use opsdesk_core::toggles::FaultToggles;

    use super::{plan_tools, resolve, ActionAgent};
    use crate::classifier::{Classifier, ClassifierError, FixedClassifier};
    use crate::stage::Agent;
    use crate::tools::ToolExecutor;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn invoke(&self, call: ToolCall) -> Result<Value, ToolFailure> {
            Ok(json!({ "tool": call.tool.as_str(), "operation": "created" }))
        }
    }

    struct BrokenClassifier;

    #[async_trait]
    impl Classifier for BrokenClassifier {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn classify(&self, _text: &str) -> Result<Classification, ClassifierError> {
            Err(ClassifierError::Unavailable("model offline".to_string()))
        }
    }

    fn context_with(records: UserRecords) -> RequestContext {
        let mut ctx = RequestContext::new(
            UserId::new("user_006"),
            "I would like a refund for the speakers I bought last month",
            FaultToggles::default(),
            Utc::now(),
        );
        ctx.commit_policies(PolicySet::default()).expect("policies");
        ctx.commit_records(records).expect("records");
        ctx
    }

    fn receipt(tool: ToolName, ok: bool, operation: &str) -> ToolReceipt {
        let outcome = if ok {
            ToolOutcome::Succeeded { response: json!({ "operation": operation }) }
        } else {
            ToolOutcome::Failed { failure: ToolFailure::injected(tool, "simulated") }
        };
        ToolReceipt { tool, args: json!({}), outcome, latency_ms: 1 }
    }

    fn tools(plan: &[ToolCall]) -> Vec<ToolName> {
        plan.iter().map(|call| call.tool).collect()
    }

    #[test]
    fn negative_sentiment_appends_escalation_to_any_intent() {
        let ctx = context_with(UserRecords::default());
        for intent in [Intent::Refund, Intent::Inquiry, Intent::General] {
            let classification = Classification::model(intent, Sentiment::Negative);
            let decision = (intent == Intent::Refund).then(|| RefundDecision::Ineligible {
                order_id: OrderId("ORD-1".to_string()),
                policy_id: PolicyId("pol".to_string()),
                reasons: vec!["outside window".to_string()],
            });
            let plan =
                plan_tools(&ctx, &UserRecords::default(), &classification, decision.as_ref());
            assert!(tools(&plan).contains(&ToolName::EscalateTicket), "{intent:?}");
        }
    }

    #[test]
    fn human_review_escalates_once_even_when_negative() {
        let ctx = context_with(UserRecords::default());
        let decision = RefundDecision::NeedsHumanReview { reason: "no policy".to_string() };
        let plan = plan_tools(
            &ctx,
            &UserRecords::default(),
            &Classification::model(Intent::Refund, Sentiment::Negative),
            Some(&decision),
        );
        assert_eq!(tools(&plan), vec![ToolName::EscalateTicket, ToolName::CreateOrUpdateTicket]);
    }

    #[test]
    fn general_intent_only_logs_a_ticket() {
        let ctx = context_with(UserRecords::default());
        let plan = plan_tools(
            &ctx,
            &UserRecords::default(),
            &Classification::model(Intent::General, Sentiment::Neutral),
            None,
        );
        assert_eq!(tools(&plan), vec![ToolName::CreateOrUpdateTicket]);
    }

    #[test]
    fn resolution_follows_priority_over_succeeded_tools() {
        let review = RefundDecision::NeedsHumanReview { reason: "none".to_string() };
        assert_eq!(resolve(None, &[]), Resolution::NoActionRequired);
        assert_eq!(
            resolve(
                None,
                &[
                    receipt(ToolName::CreateRefundRequest, true, "created"),
                    receipt(ToolName::EscalateTicket, true, "escalated"),
                ]
            ),
            Resolution::RefundRequestCreated
        );
        assert_eq!(
            resolve(Some(&review), &[receipt(ToolName::EscalateTicket, true, "created")]),
            Resolution::EscalatedForReview
        );
        assert_eq!(
            resolve(
                None,
                &[
                    receipt(ToolName::ExplainRefundStatus, true, ""),
                    receipt(ToolName::CreateOrUpdateTicket, true, "updated"),
                ]
            ),
            Resolution::TicketUpdated
        );
        assert_eq!(
            resolve(
                None,
                &[
                    receipt(ToolName::CreateRefundRequest, false, ""),
                    receipt(ToolName::ExplainOrderStatus, true, ""),
                ]
            ),
            Resolution::OrderStatusExplained
        );
        assert_eq!(
            resolve(None, &[receipt(ToolName::CreateRefundRequest, false, "")]),
            Resolution::ActionFailed
        );
    }

    #[tokio::test]
    async fn empty_policies_never_auto_decide() {
        let agent = ActionAgent::new(
            Arc::new(FixedClassifier::new(Intent::Refund, Sentiment::Neutral)),
            Arc::new(EchoExecutor),
            Duration::from_secs(1),
        );

        let outcome = agent.run(&context_with(UserRecords::default())).await.expect("outcome");

        let decision = outcome.decision.as_ref().expect("refund decision");
        assert!(!decision.is_automatic());
        assert_eq!(outcome.resolution, Resolution::EscalatedForReview);
        assert!(!outcome.invoked_tools().contains(&ToolName::CreateRefundRequest));
    }

    #[tokio::test]
    async fn classifier_failure_falls_back_and_is_flagged() {
        let agent = ActionAgent::new(
            Arc::new(BrokenClassifier),
            Arc::new(EchoExecutor),
            Duration::from_secs(1),
        );

        let outcome = agent.run(&context_with(UserRecords::default())).await.expect("outcome");

        assert_eq!(outcome.classification.source, ClassificationSource::Fallback);
        assert_eq!(outcome.classification.intent, Intent::General);
        assert!(outcome.degraded.as_deref().is_some_and(|reason| reason.contains("model offline")));
        assert_eq!(outcome.planned, vec![ToolName::CreateOrUpdateTicket]);
    }

    #[tokio::test]
    async fn missing_records_is_fatal() {
        let agent = ActionAgent::new(
            Arc::new(FixedClassifier::default()),
            Arc::new(EchoExecutor),
            Duration::from_secs(1),
        );
        let ctx = RequestContext::new(
            UserId::new("user_001"),
            "refund",
            FaultToggles::default(),
            Utc::now(),
        );

        let failure = agent.run(&ctx).await.expect_err("no policies yet");
        assert!(failure.is_fatal());
    }
}
