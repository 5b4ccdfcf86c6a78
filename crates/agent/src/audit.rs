use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use opsdesk_core::action::{ActionOutcome, RefundDecision};
use opsdesk_core::audit::{AuditRecord, PolicyCitation, RecordsSummary};
use opsdesk_core::context::{PolicySet, RequestContext, UserRecords};
use opsdesk_core::domain::classification::{Classification, ClassificationSource};
use opsdesk_core::errors::StageFailure;
use opsdesk_core::pipeline::Stage;

use crate::stage::Agent;

const QUERY_PREVIEW_LIMIT: usize = 100;
const SEGMENT_SEPARATOR: &str = " | ";

/// A7: turns the finished context into the audit record. Makes no external
/// calls; the only failure is a context missing an earlier stage's output.
#[derive(Clone, Copy, Debug, Default)]
pub struct AuditAgent;

#[async_trait]
impl Agent for AuditAgent {
    type Output = AuditRecord;

    fn stage(&self) -> Stage {
        Stage::Audit
    }

    async fn run(&self, ctx: &RequestContext) -> Result<AuditRecord, StageFailure> {
        build_record(ctx)
    }
}

pub fn build_record(ctx: &RequestContext) -> Result<AuditRecord, StageFailure> {
    let policies = ctx.policies().ok_or_else(|| malformed("policies"))?;
    let records = ctx.records().ok_or_else(|| malformed("records"))?;
    let action = ctx.action().ok_or_else(|| malformed("action_result"))?;

    let citations: Vec<PolicyCitation> = policies
        .policies
        .iter()
        .map(|hit| PolicyCitation {
            policy_id: hit.policy.id.clone(),
            version: hit.policy.version.clone(),
            region: hit.policy.region,
            relevance: hit.relevance,
            active_at_request: hit.policy.is_active_at(ctx.as_of()),
            effective_until: hit.policy.effective_until,
        })
        .collect();
    let stale_policy_used = citations.iter().any(|citation| !citation.active_at_request);
    let summary = summarize_records(records);
    let degradations = collect_degradations(policies, records, action);

    let rationale = [
        request_segment(ctx),
        policy_segment(policies, &citations),
        records_segment(records, &summary),
        classification_segment(&action.classification),
        decision_segment(action.decision.as_ref(), &action.classification),
        tools_segment(action),
        tool_details_segment(action),
        degradation_segment(&degradations),
        format!("resolution: {}", action.resolution.as_str()),
    ]
    .into_iter()
    .filter(|segment| !segment.is_empty())
    .collect::<Vec<_>>()
    .join(SEGMENT_SEPARATOR);

    Ok(AuditRecord {
        interaction_id: Uuid::new_v4().to_string(),
        request_id: ctx.request_id().to_string(),
        user_id: ctx.user_id().clone(),
        policies: citations,
        drift_forced: policies.drift_applied,
        stale_policy_used,
        records: summary,
        classification: action.classification.clone(),
        decision: action.decision.clone(),
        tool_receipts: action.receipts.clone(),
        resolution: action.resolution,
        degradations,
        stage_timings: ctx.stage_timings().to_vec(),
        rationale,
        created_at: ctx.as_of(),
    })
}

fn malformed(field: &str) -> StageFailure {
    StageFailure::fatal(Stage::Audit, format!("malformed context: `{field}` was never committed"))
}

fn summarize_records(records: &UserRecords) -> RecordsSummary {
    RecordsSummary {
        order_count: records.orders.len(),
        refund_request_count: records.refund_requests.len(),
        ticket_count: records.tickets.len(),
        refund_statuses: records
            .refund_requests
            .iter()
            .map(|request| format!("{}:{}", request.request_id, request.status.as_str()))
            .collect(),
        refund_total: records.refund_requests.iter().map(|request| request.amount).sum::<Decimal>(),
        active_ticket_count: records
            .tickets
            .iter()
            .filter(|ticket| ticket.status.is_active())
            .count(),
    }
}

fn collect_degradations(
    policies: &PolicySet,
    records: &UserRecords,
    action: &ActionOutcome,
) -> Vec<String> {
    let mut degradations = Vec::new();
    if let Some(reason) = &policies.degraded {
        degradations.push(format!("policy retrieval degraded: {reason}"));
    }
    if let Some(reason) = &records.degraded {
        degradations.push(format!("records unavailable: {reason}"));
    }
    if let Some(reason) = &action.degraded {
        degradations.push(format!("action degraded: {reason}"));
    }
    for receipt in action.failed_receipts() {
        if let Some(failure) = receipt.failure() {
            let marker = if failure.injected { " (simulated)" } else { "" };
            degradations.push(format!(
                "tool {} failed{marker}: {}",
                receipt.tool.as_str(),
                failure.reason
            ));
        }
    }
    degradations
}

fn request_segment(ctx: &RequestContext) -> String {
    let query = ctx.query_text();
    let preview: String = query.chars().take(QUERY_PREVIEW_LIMIT).collect();
    let ellipsis = if query.chars().count() > QUERY_PREVIEW_LIMIT { "..." } else { "" };
    format!("request from {}: \"{preview}{ellipsis}\"", ctx.user_id())
}

fn policy_segment(policies: &PolicySet, citations: &[PolicyCitation]) -> String {
    if citations.is_empty() {
        let mut segment = "policy: no applicable policy found".to_string();
        if policies.degraded.is_some() {
            segment.push_str(" (policy store degraded)");
        }
        return segment;
    }

    let regions = dedup(citations.iter().map(|citation| citation.region.as_str().to_string()));
    let versions: Vec<String> = citations.iter().map(|citation| citation.version.clone()).collect();
    let mut segment = format!(
        "policy: {} considered, regions {}, versions {}",
        citations.len(),
        regions.join("/"),
        versions.join(", ")
    );
    if policies.drift_applied {
        segment.push_str(", drift forced");
    }
    for citation in citations.iter().filter(|citation| !citation.active_at_request) {
        let expired = citation
            .effective_until
            .map(|until| until.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "an unknown date".to_string());
        segment.push_str(&format!(
            "; WARNING stale policy {} ({}) used, expired {expired}",
            citation.version, citation.policy_id
        ));
    }
    segment
}

fn records_segment(records: &UserRecords, summary: &RecordsSummary) -> String {
    let mut segment = format!("records: {} order(s)", summary.order_count);
    if summary.refund_request_count == 0 {
        segment.push_str(", no refund requests");
    } else {
        segment.push_str(&format!(
            ", {} refund request(s) [{}] totalling {}",
            summary.refund_request_count,
            summary.refund_statuses.join(", "),
            summary.refund_total
        ));
    }
    if records.tickets.is_empty() {
        segment.push_str(", no tickets");
    } else {
        let tickets: Vec<String> = records
            .tickets
            .iter()
            .map(|ticket| {
                format!(
                    "{}:{}/{}",
                    ticket.ticket_id,
                    ticket.status.as_str(),
                    ticket.sentiment.as_str()
                )
            })
            .collect();
        segment.push_str(&format!(", {} ticket(s) [{}]", summary.ticket_count, tickets.join(", ")));
    }
    segment
}

fn classification_segment(classification: &Classification) -> String {
    let source = match classification.source {
        ClassificationSource::Model => "classifier",
        ClassificationSource::Substituted => "SUBSTITUTED fixed classification",
        ClassificationSource::Fallback => "fallback after classifier failure",
    };
    format!(
        "classification: intent {} sentiment {} ({source})",
        classification.intent.as_str(),
        classification.sentiment.as_str()
    )
}

fn decision_segment(decision: Option<&RefundDecision>, classification: &Classification) -> String {
    match decision {
        Some(RefundDecision::Eligible { order_id, policy_id }) => {
            format!("decision: order {order_id} eligible for refund under {policy_id}")
        }
        Some(RefundDecision::Ineligible { order_id, policy_id, reasons }) => format!(
            "decision: order {order_id} not eligible under {policy_id}: {}",
            reasons.join("; ")
        ),
        Some(RefundDecision::NeedsHumanReview { reason }) => {
            format!("decision: routed to human review ({reason})")
        }
        None => format!(
            "decision: no refund evaluation for {} intent",
            classification.intent.as_str()
        ),
    }
}

fn tools_segment(action: &ActionOutcome) -> String {
    if action.receipts.is_empty() {
        return "tools: none invoked".to_string();
    }

    let succeeded: Vec<&str> = action
        .receipts
        .iter()
        .filter(|receipt| receipt.succeeded())
        .map(|receipt| receipt.tool.as_str())
        .collect();
    let failed: Vec<String> = action
        .failed_receipts()
        .map(|receipt| {
            let simulated = receipt.failure().is_some_and(|failure| failure.injected);
            if simulated {
                format!("{} (simulated)", receipt.tool.as_str())
            } else {
                receipt.tool.as_str().to_string()
            }
        })
        .collect();

    let mut segment = format!("tools succeeded [{}]", succeeded.join(", "));
    if !failed.is_empty() {
        segment.push_str(&format!(", failed [{}]", failed.join(", ")));
    }
    segment
}

fn tool_details_segment(action: &ActionOutcome) -> String {
    let details: Vec<String> = action
        .receipts
        .iter()
        .filter_map(|receipt| {
            let response = receipt.response()?;
            let detail = response_detail(response)?;
            Some(format!("{}: {detail}", receipt.tool.as_str()))
        })
        .collect();
    if details.is_empty() {
        return String::new();
    }
    format!("details: {}", details.join("; "))
}

fn response_detail(response: &Value) -> Option<String> {
    if let Some(message) = response.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    let operation = response.get("operation").and_then(Value::as_str)?;
    let id = ["request_id", "ticket_id"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_str));
    Some(match id {
        Some(id) => format!("{operation} {id}"),
        None => operation.to_string(),
    })
}

fn degradation_segment(degradations: &[String]) -> String {
    if degradations.is_empty() {
        return String::new();
    }
    format!("degraded: {}", degradations.join("; "))
}

fn dedup(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut unique = Vec::new();
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use opsdesk_core::action::{
        ActionOutcome, RefundDecision, Resolution, ToolFailure, ToolName, ToolOutcome,
        ToolReceipt,
    };
    use opsdesk_core::context::{Degradable, PolicySet, RequestContext, UserRecords};
    use opsdesk_core::domain::classification::{Classification, Intent, Sentiment};
    use opsdesk_core::domain::customer::UserId;
    use opsdesk_core::domain::order::OrderId;
    use opsdesk_core::domain::policy::{Policy, PolicyId, Region, ScoredPolicy};
    use opsdesk_core::domain::refund::{RefundRequest, RefundRequestId, RefundStatus};
    use opsdesk_core::toggles::FaultToggles;

    use super::{build_record, AuditAgent};
    use crate::stage::Agent;

    fn stale_policy() -> ScoredPolicy {
        let now = Utc::now();
        ScoredPolicy {
            policy: Policy {
                id: PolicyId("pol-us-v23.0".to_string()),
                title: "Final sale".to_string(),
                text: String::new(),
                region: Region::Us,
                version: "v23.0".to_string(),
                effective_from: now - Duration::days(900),
                effective_until: Some(now - Duration::days(400)),
                refund_window_days: 0,
                excluded_categories: Vec::new(),
            },
            relevance: 0.6,
        }
    }

    fn committed_context(
        policies: PolicySet,
        records: UserRecords,
        action: ActionOutcome,
    ) -> RequestContext {
        let mut ctx = RequestContext::new(
            UserId::new("user_001"),
            "I need a refund for my bluetooth earbuds",
            FaultToggles::default(),
            Utc::now(),
        );
        ctx.commit_policies(policies).expect("policies");
        ctx.commit_records(records).expect("records");
        ctx.commit_action(action).expect("action");
        ctx
    }

    fn ineligible_action() -> ActionOutcome {
        ActionOutcome {
            classification: Classification::model(Intent::Refund, Sentiment::Neutral),
            decision: Some(RefundDecision::Ineligible {
                order_id: OrderId("ORD-1001".to_string()),
                policy_id: PolicyId("pol-us-v23.0".to_string()),
                reasons: vec!["policy v23.0 does not allow returns".to_string()],
            }),
            planned: vec![ToolName::ExplainRefundStatus, ToolName::CreateOrUpdateTicket],
            receipts: vec![
                ToolReceipt {
                    tool: ToolName::ExplainRefundStatus,
                    args: json!({}),
                    outcome: ToolOutcome::Succeeded {
                        response: json!({ "message": "refund not possible" }),
                    },
                    latency_ms: 1,
                },
                ToolReceipt {
                    tool: ToolName::CreateOrUpdateTicket,
                    args: json!({}),
                    outcome: ToolOutcome::Failed {
                        failure: ToolFailure::injected(
                            ToolName::CreateOrUpdateTicket,
                            "simulated 503",
                        ),
                    },
                    latency_ms: 1,
                },
            ],
            resolution: Resolution::RefundStatusExplained,
            degraded: None,
        }
    }

    #[test]
    fn record_flags_stale_policy_and_simulated_failures() {
        let policies = PolicySet {
            query: "need refund bluetooth earbuds".to_string(),
            policies: vec![stale_policy()],
            drift_applied: true,
            degraded: None,
        };
        let ctx = committed_context(policies, UserRecords::default(), ineligible_action());

        let record = build_record(&ctx).expect("record");

        assert!(record.drift_forced);
        assert!(record.stale_policy_used);
        assert!(!record.policies[0].active_at_request);
        assert!(record.rationale.contains("WARNING stale policy v23.0"));
        assert!(record.rationale.contains("create_or_update_ticket (simulated)"));
        assert_eq!(record.degradations.len(), 1);
        assert!(record.is_degraded());
        assert!(record.rationale.ends_with("resolution: refund_status_explained"));
    }

    #[test]
    fn empty_policy_set_is_called_out() {
        let ctx = committed_context(
            PolicySet::placeholder("store unavailable: policy store is not reachable"),
            UserRecords::default(),
            ineligible_action(),
        );

        let record = build_record(&ctx).expect("record");
        assert!(record.rationale.contains("no applicable policy found"));
        assert!(record
            .degradations
            .iter()
            .any(|entry| entry.starts_with("policy retrieval degraded")));
    }

    #[test]
    fn records_summary_totals_refunds() {
        let refund = |id: &str, cents: i64, status: RefundStatus| RefundRequest {
            request_id: RefundRequestId(id.to_string()),
            user_id: UserId::new("user_001"),
            order_id: OrderId("ORD-1".to_string()),
            status,
            amount: Decimal::new(cents, 2),
            created_at: Utc::now(),
            reason: String::new(),
        };
        let records = UserRecords {
            refund_requests: vec![
                refund("REF-1", 1000, RefundStatus::Completed),
                refund("REF-2", 550, RefundStatus::Denied),
            ],
            ..UserRecords::default()
        };
        let ctx = committed_context(PolicySet::default(), records, ineligible_action());

        let record = build_record(&ctx).expect("record");
        assert_eq!(record.records.refund_total, Decimal::new(1550, 2));
        assert_eq!(record.records.refund_statuses, vec!["REF-1:completed", "REF-2:denied"]);
        assert!(record.rationale.contains("totalling 15.50"));
    }

    #[test]
    fn record_is_stamped_with_the_request_time() {
        let as_of = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).single().expect("valid instant");
        let mut ctx = RequestContext::new(
            UserId::new("user_001"),
            "I need a refund for my bluetooth earbuds",
            FaultToggles::default(),
            as_of,
        );
        ctx.commit_policies(PolicySet::default()).expect("policies");
        ctx.commit_records(UserRecords::default()).expect("records");
        ctx.commit_action(ineligible_action()).expect("action");

        let first = build_record(&ctx).expect("record");
        let second = build_record(&ctx).expect("record");
        assert_eq!(first.created_at, as_of);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn incomplete_context_is_fatal() {
        let mut ctx = RequestContext::new(
            UserId::new("user_001"),
            "refund",
            FaultToggles::default(),
            Utc::now(),
        );
        ctx.commit_policies(PolicySet::default()).expect("policies");

        let failure = AuditAgent.run(&ctx).await.expect_err("records missing");
        assert!(failure.is_fatal());
        assert!(failure.reason.contains("records"));
    }
}
