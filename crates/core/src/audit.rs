use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{RefundDecision, Resolution, ToolReceipt};
use crate::context::StageTiming;
use crate::domain::classification::Classification;
use crate::domain::customer::UserId;
use crate::domain::policy::{PolicyId, Region};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Pipeline,
    Policy,
    Records,
    Action,
    Audit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Degraded,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub correlation_id: String,
    pub user_id: Option<UserId>,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        correlation_id: impl Into<String>,
        user_id: Option<UserId>,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            user_id,
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.event_type == event_type).collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Forwards audit events to the `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        let user_id = event.user_id.as_ref().map(UserId::as_str).unwrap_or("unknown");
        match event.outcome {
            AuditOutcome::Success => tracing::info!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                user_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Degraded | AuditOutcome::Cancelled => tracing::warn!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                user_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Failed => tracing::error!(
                event_name = %event.event_type,
                correlation_id = %event.correlation_id,
                user_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyCitation {
    pub policy_id: PolicyId,
    pub version: String,
    pub region: Region,
    pub relevance: f32,
    pub active_at_request: bool,
    pub effective_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordsSummary {
    pub order_count: usize,
    pub refund_request_count: usize,
    pub ticket_count: usize,
    pub refund_statuses: Vec<String>,
    pub refund_total: Decimal,
    pub active_ticket_count: usize,
}

/// The structured trail produced by the audit stage. Its presence on a context
/// marks the run as complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub interaction_id: String,
    pub request_id: String,
    pub user_id: UserId,
    pub policies: Vec<PolicyCitation>,
    pub drift_forced: bool,
    pub stale_policy_used: bool,
    pub records: RecordsSummary,
    pub classification: Classification,
    pub decision: Option<RefundDecision>,
    pub tool_receipts: Vec<ToolReceipt>,
    pub resolution: Resolution,
    pub degradations: Vec<String>,
    pub stage_timings: Vec<StageTiming>,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}
