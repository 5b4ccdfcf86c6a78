use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::ActionOutcome;
use crate::audit::AuditRecord;
use crate::domain::classification::{Classification, Intent, Sentiment};
use crate::domain::customer::UserId;
use crate::domain::order::Order;
use crate::domain::policy::ScoredPolicy;
use crate::domain::refund::RefundRequest;
use crate::domain::ticket::SupportTicket;
use crate::errors::ContextError;
use crate::pipeline::{PipelineState, Stage};
use crate::toggles::FaultToggles;

/// Stage outputs that have a well-formed stand-in when the stage fails
/// recoverably.
pub trait Degradable: Sized {
    fn placeholder(reason: impl Into<String>) -> Self;
    fn degradation(&self) -> Option<&str>;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    pub query: String,
    pub policies: Vec<ScoredPolicy>,
    /// The active-date filter was skipped and only the top hit kept.
    pub drift_applied: bool,
    pub degraded: Option<String>,
}

impl PolicySet {
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }
}

impl Degradable for PolicySet {
    fn placeholder(reason: impl Into<String>) -> Self {
        Self { degraded: Some(reason.into()), ..Self::default() }
    }

    fn degradation(&self) -> Option<&str> {
        self.degraded.as_deref()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecords {
    pub orders: Vec<Order>,
    pub refund_requests: Vec<RefundRequest>,
    pub tickets: Vec<SupportTicket>,
    pub degraded: Option<String>,
}

impl UserRecords {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.refund_requests.is_empty() && self.tickets.is_empty()
    }
}

impl Degradable for UserRecords {
    fn placeholder(reason: impl Into<String>) -> Self {
        Self { degraded: Some(reason.into()), ..Self::default() }
    }

    fn degradation(&self) -> Option<&str> {
        self.degraded.as_deref()
    }
}

impl Degradable for ActionOutcome {
    fn placeholder(reason: impl Into<String>) -> Self {
        Self {
            classification: Classification::fallback(),
            decision: None,
            planned: Vec::new(),
            receipts: Vec::new(),
            resolution: crate::action::Resolution::ActionFailed,
            degraded: Some(reason.into()),
        }
    }

    fn degradation(&self) -> Option<&str> {
        self.degraded.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// The append-only record threaded through one pipeline run.
///
/// Identity fields are fixed at creation. Stage outputs are written once, in
/// stage order, through the `commit_*` methods; nothing exposes a mutable
/// reference to an output that has already been committed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestContext {
    request_id: String,
    user_id: UserId,
    query_text: String,
    toggles: FaultToggles,
    as_of: DateTime<Utc>,
    state: PipelineState,
    policies: Option<PolicySet>,
    records: Option<UserRecords>,
    action: Option<ActionOutcome>,
    audit: Option<AuditRecord>,
    stage_timings: Vec<StageTiming>,
}

impl RequestContext {
    pub fn new(
        user_id: UserId,
        query_text: impl Into<String>,
        toggles: FaultToggles,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self::with_request_id(Uuid::new_v4().to_string(), user_id, query_text, toggles, as_of)
    }

    pub fn with_request_id(
        request_id: impl Into<String>,
        user_id: UserId,
        query_text: impl Into<String>,
        toggles: FaultToggles,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id,
            query_text: query_text.into(),
            toggles,
            as_of,
            state: PipelineState::Start,
            policies: None,
            records: None,
            action: None,
            audit: None,
            stage_timings: Vec::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    pub fn toggles(&self) -> &FaultToggles {
        &self.toggles
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn policies(&self) -> Option<&PolicySet> {
        self.policies.as_ref()
    }

    pub fn records(&self) -> Option<&UserRecords> {
        self.records.as_ref()
    }

    pub fn action(&self) -> Option<&ActionOutcome> {
        self.action.as_ref()
    }

    pub fn audit(&self) -> Option<&AuditRecord> {
        self.audit.as_ref()
    }

    pub fn stage_timings(&self) -> &[StageTiming] {
        &self.stage_timings
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.action.as_ref().map(|action| &action.classification)
    }

    pub fn intent(&self) -> Option<Intent> {
        self.classification().map(|classification| classification.intent)
    }

    pub fn sentiment(&self) -> Option<Sentiment> {
        self.classification().map(|classification| classification.sentiment)
    }

    pub fn commit_policies(&mut self, policies: PolicySet) -> Result<(), ContextError> {
        self.ensure_open()?;
        write_once(&mut self.policies, policies, "policies")?;
        self.advance(Stage::Policy)
    }

    pub fn commit_records(&mut self, records: UserRecords) -> Result<(), ContextError> {
        self.ensure_open()?;
        require(&self.policies, "records", "policies")?;
        write_once(&mut self.records, records, "records")?;
        self.advance(Stage::Records)
    }

    pub fn commit_action(&mut self, action: ActionOutcome) -> Result<(), ContextError> {
        self.ensure_open()?;
        require(&self.records, "action_result", "records")?;
        write_once(&mut self.action, action, "action_result")?;
        self.advance(Stage::Action)
    }

    pub fn commit_audit(&mut self, audit: AuditRecord) -> Result<(), ContextError> {
        self.ensure_open()?;
        require(&self.action, "audit", "action_result")?;
        write_once(&mut self.audit, audit, "audit")?;
        self.advance(Stage::Audit)
    }

    pub fn record_timing(&mut self, stage: Stage, elapsed_ms: u64) {
        self.stage_timings.push(StageTiming { stage, elapsed_ms });
    }

    /// Moves the run into `Aborted` and returns the state it was in before.
    pub fn abort(&mut self) -> Result<PipelineState, ContextError> {
        let last_state = self.state;
        self.state
            .transition_to(PipelineState::Aborted)
            .map_err(|_| ContextError::Terminal(last_state.as_str()))?;
        Ok(last_state)
    }

    fn ensure_open(&self) -> Result<(), ContextError> {
        if self.state.is_terminal() {
            return Err(ContextError::Terminal(self.state.as_str()));
        }
        Ok(())
    }

    fn advance(&mut self, stage: Stage) -> Result<(), ContextError> {
        let current = self.state.as_str();
        self.state
            .transition_to(stage.completes_into())
            .map_err(|_| ContextError::Terminal(current))
    }
}

fn write_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<(), ContextError> {
    if slot.is_some() {
        return Err(ContextError::AlreadyCommitted(field));
    }
    *slot = Some(value);
    Ok(())
}

fn require<T>(
    slot: &Option<T>,
    field: &'static str,
    missing: &'static str,
) -> Result<(), ContextError> {
    if slot.is_none() {
        return Err(ContextError::OutOfOrder { field, missing });
    }
    Ok(())
}
