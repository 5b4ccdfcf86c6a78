use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::classification::Classification;
use crate::domain::order::OrderId;
use crate::domain::policy::PolicyId;
use crate::errors::FailureKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    CreateOrUpdateTicket,
    EscalateTicket,
    CreateRefundRequest,
    ExplainRefundStatus,
    ExplainOrderStatus,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateOrUpdateTicket => "create_or_update_ticket",
            Self::EscalateTicket => "escalate_ticket",
            Self::CreateRefundRequest => "create_refund_request",
            Self::ExplainRefundStatus => "explain_refund_status",
            Self::ExplainOrderStatus => "explain_order_status",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create_or_update_ticket" => Some(Self::CreateOrUpdateTicket),
            "escalate_ticket" => Some(Self::EscalateTicket),
            "create_refund_request" => Some(Self::CreateRefundRequest),
            "explain_refund_status" => Some(Self::ExplainRefundStatus),
            "explain_order_status" => Some(Self::ExplainOrderStatus),
            _ => None,
        }
    }

    /// Tools that write to the records store rather than only reading it.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::CreateOrUpdateTicket | Self::EscalateTicket | Self::CreateRefundRequest
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: ToolName,
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: ToolName, args: Value) -> Self {
        Self { tool, args }
    }
}

/// Failure of one tool invocation. Simulated failures use this same type with
/// `injected` set, so they travel through the regular failure handling.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{} failed ({}): {reason}", .tool.as_str(), .kind.as_str())]
pub struct ToolFailure {
    pub tool: ToolName,
    pub kind: FailureKind,
    pub reason: String,
    pub injected: bool,
}

impl ToolFailure {
    pub fn recoverable(tool: ToolName, reason: impl Into<String>) -> Self {
        Self { tool, kind: FailureKind::Recoverable, reason: reason.into(), injected: false }
    }

    pub fn fatal(tool: ToolName, reason: impl Into<String>) -> Self {
        Self { tool, kind: FailureKind::Fatal, reason: reason.into(), injected: false }
    }

    pub fn injected(tool: ToolName, reason: impl Into<String>) -> Self {
        Self { tool, kind: FailureKind::Recoverable, reason: reason.into(), injected: true }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Succeeded { response: Value },
    Failed { failure: ToolFailure },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolReceipt {
    pub tool: ToolName,
    pub args: Value,
    pub outcome: ToolOutcome,
    pub latency_ms: u64,
}

impl ToolReceipt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Succeeded { .. })
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match &self.outcome {
            ToolOutcome::Failed { failure } => Some(failure),
            ToolOutcome::Succeeded { .. } => None,
        }
    }

    pub fn response(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Succeeded { response } => Some(response),
            ToolOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RefundDecision {
    Eligible { order_id: OrderId, policy_id: PolicyId },
    Ineligible { order_id: OrderId, policy_id: PolicyId, reasons: Vec<String> },
    NeedsHumanReview { reason: String },
}

impl RefundDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Eligible { .. } => "eligible",
            Self::Ineligible { .. } => "ineligible",
            Self::NeedsHumanReview { .. } => "needs_human_review",
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible { .. })
    }

    /// Approve or deny was decided without a human.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::NeedsHumanReview { .. })
    }

    pub fn order_id(&self) -> Option<&OrderId> {
        match self {
            Self::Eligible { order_id, .. } | Self::Ineligible { order_id, .. } => Some(order_id),
            Self::NeedsHumanReview { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    RefundRequestCreated,
    EscalatedForReview,
    TicketEscalated,
    TicketUpdated,
    TicketCreated,
    RefundStatusExplained,
    OrderStatusExplained,
    ActionFailed,
    NoActionRequired,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefundRequestCreated => "refund_request_created",
            Self::EscalatedForReview => "escalated_for_review",
            Self::TicketEscalated => "ticket_escalated",
            Self::TicketUpdated => "ticket_updated",
            Self::TicketCreated => "ticket_created",
            Self::RefundStatusExplained => "refund_status_explained",
            Self::OrderStatusExplained => "order_status_explained",
            Self::ActionFailed => "action_failed",
            Self::NoActionRequired => "no_action_required",
        }
    }
}

/// Everything the action stage decided and did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub classification: Classification,
    pub decision: Option<RefundDecision>,
    pub planned: Vec<ToolName>,
    pub receipts: Vec<ToolReceipt>,
    pub resolution: Resolution,
    pub degraded: Option<String>,
}

impl ActionOutcome {
    pub fn invoked_tools(&self) -> Vec<ToolName> {
        self.receipts.iter().map(|receipt| receipt.tool).collect()
    }

    pub fn failed_receipts(&self) -> impl Iterator<Item = &ToolReceipt> {
        self.receipts.iter().filter(|receipt| !receipt.succeeded())
    }

    pub fn simulated_failure_count(&self) -> usize {
        self.failed_receipts()
            .filter(|receipt| receipt.failure().is_some_and(|failure| failure.injected))
            .count()
    }
}
