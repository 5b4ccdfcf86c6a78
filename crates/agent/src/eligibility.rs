//! Refund eligibility. Pure functions over the policy set and customer
//! records; no collaborator calls happen here.

use chrono::{DateTime, Utc};

use opsdesk_core::action::RefundDecision;
use opsdesk_core::context::{PolicySet, UserRecords};
use opsdesk_core::domain::order::Order;
use opsdesk_core::domain::policy::{Policy, Region, ScoredPolicy};
use opsdesk_core::domain::refund::RefundRequest;
use opsdesk_core::text;

/// The order a message is about: the first whose product name shares a
/// content token with the message, otherwise the most recent one. Expects
/// `orders` newest first.
pub fn relevant_order<'a>(orders: &'a [Order], query_text: &str) -> Option<&'a Order> {
    let query_tokens = text::content_tokens(query_text);
    orders
        .iter()
        .find(|order| {
            text::tokenize(&order.product).iter().any(|token| query_tokens.contains(token))
        })
        .or_else(|| orders.first())
}

/// Highest-relevance policy for the order's region, or the highest-relevance
/// policy overall when none matches.
pub fn governing_policy(policies: &[ScoredPolicy], region: Region) -> Option<&Policy> {
    policies
        .iter()
        .find(|hit| hit.policy.region == region)
        .or_else(|| policies.first())
        .map(|hit| &hit.policy)
}

pub fn evaluate(
    policies: &PolicySet,
    records: &UserRecords,
    query_text: &str,
    as_of: DateTime<Utc>,
) -> RefundDecision {
    let Some(order) = relevant_order(&records.orders, query_text) else {
        return RefundDecision::NeedsHumanReview {
            reason: "no order on record for this customer".to_string(),
        };
    };

    let Some(policy) = governing_policy(&policies.policies, order.region()) else {
        return RefundDecision::NeedsHumanReview {
            reason: format!("no applicable refund policy found for order {}", order.order_id),
        };
    };

    let reasons = denial_reasons(policy, order, &records.refund_requests, as_of);
    if reasons.is_empty() {
        RefundDecision::Eligible { order_id: order.order_id.clone(), policy_id: policy.id.clone() }
    } else {
        RefundDecision::Ineligible {
            order_id: order.order_id.clone(),
            policy_id: policy.id.clone(),
            reasons,
        }
    }
}

fn denial_reasons(
    policy: &Policy,
    order: &Order,
    refund_requests: &[RefundRequest],
    as_of: DateTime<Utc>,
) -> Vec<String> {
    let mut reasons = Vec::new();

    let days = order.days_since_purchase(as_of);
    if !policy.allows_returns() {
        reasons.push(format!("policy {} does not allow returns", policy.version));
    } else if days > i64::from(policy.refund_window_days) {
        reasons.push(format!(
            "purchased {days} days ago, outside the {}-day refund window of policy {}",
            policy.refund_window_days, policy.version
        ));
    }

    if policy.excludes_category(&order.category) {
        reasons.push(format!(
            "category `{}` is excluded by policy {}",
            order.category, policy.version
        ));
    }

    for request in refund_requests.iter().filter(|request| request.order_id == order.order_id) {
        if request.status.is_settled() {
            reasons.push(format!(
                "order {} already has a refund marked {} ({})",
                order.order_id,
                request.status.as_str(),
                request.request_id
            ));
        } else if request.status.is_in_flight() {
            reasons.push(format!(
                "a refund for order {} is already {} ({})",
                order.order_id,
                request.status.as_str(),
                request.request_id
            ));
        }
    }

    reasons
}
