use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use opsdesk_core::action::{ToolCall, ToolFailure, ToolName};
use opsdesk_core::clock::Clock;
use opsdesk_core::domain::classification::Sentiment;
use opsdesk_core::domain::customer::UserId;
use opsdesk_core::domain::order::OrderId;
use opsdesk_core::domain::refund::{RefundRequest, RefundRequestId, RefundStatus};
use opsdesk_core::domain::ticket::{SupportTicket, TicketId, TicketStatus};
use opsdesk_core::toggles::ErrorRate;
use opsdesk_db::{RecordsRepository, RepositoryError};

const ESCALATION_LEVEL: &str = "tier2";

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> ToolName;
    async fn execute(&self, input: Value) -> Result<Value, ToolFailure>;
}

/// The only path through which the action stage causes writes.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolFailure>;
}

#[async_trait]
impl<T: ToolExecutor + ?Sized> ToolExecutor for Arc<T> {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolFailure> {
        (**self).invoke(call).await
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolName, Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with every customer-service tool wired to `repository`.
    pub fn with_records(repository: Arc<dyn RecordsRepository>, clock: Arc<dyn Clock>) -> Self {
        let mut registry = Self::default();
        registry.register(CreateOrUpdateTicketTool::new(repository.clone(), clock.clone()));
        registry.register(EscalateTicketTool::new(repository.clone(), clock.clone()));
        registry.register(CreateRefundRequestTool::new(repository.clone(), clock));
        registry.register(ExplainRefundStatusTool::new(repository.clone()));
        registry.register(ExplainOrderStatusTool::new(repository));
        registry
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, tool: ToolName) -> bool {
        self.tools.contains_key(&tool)
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolFailure> {
        let Some(tool) = self.tools.get(&call.tool) else {
            return Err(ToolFailure::fatal(call.tool, "tool is not registered"));
        };
        tool.execute(call.args).await
    }
}

/// Decorates an executor with simulated upstream errors. Each call draws from
/// the run's generator; a draw below the error rate fails the call before the
/// inner executor sees it.
pub struct FaultInjectingExecutor<E> {
    inner: E,
    rate: ErrorRate,
    rng: Mutex<StdRng>,
}

impl<E: ToolExecutor> FaultInjectingExecutor<E> {
    pub fn new(inner: E, rate: ErrorRate, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { inner, rate, rng: Mutex::new(rng) }
    }

    fn draw(&self) -> f64 {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen::<f64>()
    }
}

#[async_trait]
impl<E: ToolExecutor> ToolExecutor for FaultInjectingExecutor<E> {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolFailure> {
        let draw = self.draw();
        if draw < self.rate.value() {
            tracing::warn!(
                event_name = "tool.failure.injected",
                tool = call.tool.as_str(),
                draw,
                error_rate = self.rate.value(),
                "simulated tool failure"
            );
            return Err(ToolFailure::injected(
                call.tool,
                format!(
                    "simulated upstream error (draw {draw:.3} below rate {:.3})",
                    self.rate.value()
                ),
            ));
        }
        self.inner.invoke(call).await
    }
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, input: Value) -> Result<T, ToolFailure> {
    serde_json::from_value(input)
        .map_err(|error| ToolFailure::fatal(tool, format!("invalid arguments: {error}")))
}

fn store_failure(tool: ToolName) -> impl Fn(RepositoryError) -> ToolFailure {
    move |error| match error {
        RepositoryError::Unavailable(_) => ToolFailure::recoverable(tool, error.to_string()),
        RepositoryError::InvalidUserId(_) | RepositoryError::Decode(_) => {
            ToolFailure::fatal(tool, error.to_string())
        }
    }
}

fn short_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", id[..8].to_ascii_uppercase())
}

/// The ticket an interaction should attach to: an active ticket on the same
/// order if there is one, otherwise the most recently updated active ticket.
fn active_ticket(tickets: Vec<SupportTicket>, order_id: Option<&OrderId>) -> Option<SupportTicket> {
    let mut active: Vec<SupportTicket> =
        tickets.into_iter().filter(|ticket| ticket.status.is_active()).collect();
    active.sort_by(|left, right| {
        right
            .updated_at
            .cmp(&left.updated_at)
            .then_with(|| left.ticket_id.0.cmp(&right.ticket_id.0))
    });

    if let Some(order_id) = order_id {
        if let Some(position) =
            active.iter().position(|ticket| ticket.order_id.as_ref() == Some(order_id))
        {
            return Some(active.remove(position));
        }
    }
    active.into_iter().next()
}

#[derive(Deserialize)]
struct TicketArgs {
    user_id: UserId,
    #[serde(default)]
    order_id: Option<OrderId>,
    sentiment: Sentiment,
    summary: String,
}

pub struct CreateOrUpdateTicketTool {
    repository: Arc<dyn RecordsRepository>,
    clock: Arc<dyn Clock>,
}

impl CreateOrUpdateTicketTool {
    pub fn new(repository: Arc<dyn RecordsRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }
}

#[async_trait]
impl Tool for CreateOrUpdateTicketTool {
    fn name(&self) -> ToolName {
        ToolName::CreateOrUpdateTicket
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        let args: TicketArgs = parse_args(self.name(), input)?;
        let now = self.clock.now();
        let existing = self
            .repository
            .list_tickets(&args.user_id)
            .await
            .map_err(store_failure(self.name()))?;

        let (ticket, operation) = match active_ticket(existing, args.order_id.as_ref()) {
            Some(mut ticket) => {
                ticket.summary = args.summary;
                ticket.sentiment = args.sentiment;
                ticket.updated_at = now;
                if ticket.order_id.is_none() {
                    ticket.order_id = args.order_id;
                }
                (ticket, "updated")
            }
            None => (
                SupportTicket {
                    ticket_id: TicketId(short_id("TCK")),
                    user_id: args.user_id,
                    order_id: args.order_id,
                    status: TicketStatus::Open,
                    sentiment: args.sentiment,
                    summary: args.summary,
                    escalation_level: None,
                    created_at: now,
                    updated_at: now,
                },
                "created",
            ),
        };

        let response = json!({
            "ticket_id": ticket.ticket_id.0,
            "status": ticket.status.as_str(),
            "operation": operation,
        });
        self.repository.save_ticket(ticket).await.map_err(store_failure(self.name()))?;
        Ok(response)
    }
}

#[derive(Deserialize)]
struct EscalateArgs {
    user_id: UserId,
    #[serde(default)]
    order_id: Option<OrderId>,
    reason: String,
    #[serde(default)]
    sentiment: Option<Sentiment>,
}

pub struct EscalateTicketTool {
    repository: Arc<dyn RecordsRepository>,
    clock: Arc<dyn Clock>,
}

impl EscalateTicketTool {
    pub fn new(repository: Arc<dyn RecordsRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }
}

#[async_trait]
impl Tool for EscalateTicketTool {
    fn name(&self) -> ToolName {
        ToolName::EscalateTicket
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        let args: EscalateArgs = parse_args(self.name(), input)?;
        let now = self.clock.now();
        let existing = self
            .repository
            .list_tickets(&args.user_id)
            .await
            .map_err(store_failure(self.name()))?;

        let (mut ticket, operation) = match active_ticket(existing, args.order_id.as_ref()) {
            Some(ticket) => (ticket, "escalated"),
            None => (
                SupportTicket {
                    ticket_id: TicketId(short_id("TCK")),
                    user_id: args.user_id,
                    order_id: args.order_id,
                    status: TicketStatus::Open,
                    sentiment: args.sentiment.unwrap_or(Sentiment::Neutral),
                    summary: args.reason.clone(),
                    escalation_level: None,
                    created_at: now,
                    updated_at: now,
                },
                "created",
            ),
        };

        ticket.status = TicketStatus::Escalated;
        ticket.escalation_level = Some(ESCALATION_LEVEL.to_string());
        ticket.updated_at = now;

        let response = json!({
            "ticket_id": ticket.ticket_id.0,
            "status": ticket.status.as_str(),
            "escalation_level": ESCALATION_LEVEL,
            "reason": args.reason,
            "operation": operation,
        });
        self.repository.save_ticket(ticket).await.map_err(store_failure(self.name()))?;
        Ok(response)
    }
}

#[derive(Deserialize)]
struct RefundArgs {
    user_id: UserId,
    order_id: OrderId,
    reason: String,
}

pub struct CreateRefundRequestTool {
    repository: Arc<dyn RecordsRepository>,
    clock: Arc<dyn Clock>,
}

impl CreateRefundRequestTool {
    pub fn new(repository: Arc<dyn RecordsRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }
}

#[async_trait]
impl Tool for CreateRefundRequestTool {
    fn name(&self) -> ToolName {
        ToolName::CreateRefundRequest
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        let tool = self.name();
        let args: RefundArgs = parse_args(tool, input)?;

        let order = self
            .repository
            .find_order(&args.order_id)
            .await
            .map_err(store_failure(tool))?
            .ok_or_else(|| ToolFailure::fatal(tool, format!("order {} not found", args.order_id)))?;
        if order.user_id != args.user_id {
            return Err(ToolFailure::fatal(
                tool,
                format!("order {} does not belong to {}", order.order_id, args.user_id),
            ));
        }

        let existing = self
            .repository
            .list_refund_requests(&args.user_id)
            .await
            .map_err(store_failure(tool))?
            .into_iter()
            .find(|request| request.order_id == order.order_id && request.status.is_in_flight());
        if let Some(request) = existing {
            return Ok(json!({
                "request_id": request.request_id.0,
                "order_id": request.order_id.0,
                "status": request.status.as_str(),
                "amount": request.amount,
                "operation": "existing",
            }));
        }

        let request = RefundRequest {
            request_id: RefundRequestId(short_id("REF")),
            user_id: args.user_id,
            order_id: order.order_id.clone(),
            status: RefundStatus::Submitted,
            amount: order.amount,
            created_at: self.clock.now(),
            reason: args.reason,
        };
        let response = json!({
            "request_id": request.request_id.0,
            "order_id": request.order_id.0,
            "status": request.status.as_str(),
            "amount": request.amount,
            "currency": order.currency,
            "operation": "created",
        });
        self.repository.save_refund_request(request).await.map_err(store_failure(tool))?;
        Ok(response)
    }
}

#[derive(Deserialize)]
struct ExplainRefundArgs {
    user_id: UserId,
    #[serde(default)]
    order_id: Option<OrderId>,
    #[serde(default)]
    denial_reasons: Vec<String>,
}

pub struct ExplainRefundStatusTool {
    repository: Arc<dyn RecordsRepository>,
}

impl ExplainRefundStatusTool {
    pub fn new(repository: Arc<dyn RecordsRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Tool for ExplainRefundStatusTool {
    fn name(&self) -> ToolName {
        ToolName::ExplainRefundStatus
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        let args: ExplainRefundArgs = parse_args(self.name(), input)?;
        let mut requests = self
            .repository
            .list_refund_requests(&args.user_id)
            .await
            .map_err(store_failure(self.name()))?;
        if let Some(order_id) = &args.order_id {
            requests.retain(|request| &request.order_id == order_id);
        }
        requests.sort_by(|left, right| right.created_at.cmp(&left.created_at));

        let message = if !args.denial_reasons.is_empty() {
            format!("refund not possible: {}", args.denial_reasons.join("; "))
        } else if let Some(latest) = requests.first() {
            format!(
                "{} refund request(s) on record, latest {} is {}",
                requests.len(),
                latest.request_id,
                latest.status.as_str()
            )
        } else {
            "no refund requests on record".to_string()
        };

        let summaries: Vec<Value> = requests
            .iter()
            .map(|request| {
                json!({
                    "request_id": request.request_id.0,
                    "order_id": request.order_id.0,
                    "status": request.status.as_str(),
                    "amount": request.amount,
                })
            })
            .collect();

        Ok(json!({
            "order_id": args.order_id.map(|order_id| order_id.0),
            "refund_requests": summaries,
            "denial_reasons": args.denial_reasons,
            "message": message,
        }))
    }
}

#[derive(Deserialize)]
struct ExplainOrderArgs {
    user_id: UserId,
    #[serde(default)]
    order_id: Option<OrderId>,
}

pub struct ExplainOrderStatusTool {
    repository: Arc<dyn RecordsRepository>,
}

impl ExplainOrderStatusTool {
    pub fn new(repository: Arc<dyn RecordsRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Tool for ExplainOrderStatusTool {
    fn name(&self) -> ToolName {
        ToolName::ExplainOrderStatus
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        let args: ExplainOrderArgs = parse_args(self.name(), input)?;
        let order = match &args.order_id {
            Some(order_id) => {
                self.repository.find_order(order_id).await.map_err(store_failure(self.name()))?
            }
            None => None,
        };

        let Some(order) = order.filter(|order| order.user_id == args.user_id) else {
            return Ok(json!({
                "order_id": args.order_id.map(|order_id| order_id.0),
                "message": "no matching order on record",
            }));
        };

        Ok(json!({
            "order_id": order.order_id.0,
            "product": order.product,
            "shipping_status": order.shipping_status.as_str(),
            "purchase_date": order.purchase_date.to_rfc3339(),
            "message": format!(
                "order {} ({}) is {}",
                order.order_id,
                order.product,
                order.shipping_status.as_str().replace('_', " ")
            ),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use opsdesk_core::action::{ToolCall, ToolName};
    use opsdesk_core::clock::FixedClock;
    use opsdesk_core::domain::customer::UserId;
    use opsdesk_core::domain::ticket::TicketStatus;
    use opsdesk_core::errors::FailureKind;
    use opsdesk_core::toggles::ErrorRate;
    use opsdesk_db::{InMemoryPolicyStore, InMemoryRecordsStore, RecordsRepository, SeedDataset};

    use super::{FaultInjectingExecutor, ToolExecutor, ToolRegistry};

    async fn registry() -> (ToolRegistry, Arc<InMemoryRecordsStore>) {
        let reference = Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).single().expect("valid date");
        let records = Arc::new(InMemoryRecordsStore::default());
        SeedDataset::build(reference)
            .load_into(&InMemoryPolicyStore::default(), &records)
            .await
            .expect("seed");
        let registry = ToolRegistry::with_records(records.clone(), Arc::new(FixedClock(reference)));
        (registry, records)
    }

    #[tokio::test]
    async fn registry_registers_every_tool() {
        let (registry, _) = registry().await;
        assert_eq!(registry.len(), 5);
        assert!(registry.contains(ToolName::ExplainOrderStatus));
    }

    #[tokio::test]
    async fn unregistered_tool_is_a_fatal_failure() {
        let registry = ToolRegistry::default();
        let failure = registry
            .invoke(ToolCall::new(ToolName::EscalateTicket, json!({})))
            .await
            .expect_err("nothing registered");
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert!(!failure.injected);
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_fatal_failure() {
        let (registry, _) = registry().await;
        let failure = registry
            .invoke(ToolCall::new(ToolName::CreateRefundRequest, json!({ "user_id": 7 })))
            .await
            .expect_err("bad args");
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert!(failure.reason.starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn refund_request_is_created_once_per_order() {
        let (registry, records) = registry().await;
        let call = ToolCall::new(
            ToolName::CreateRefundRequest,
            json!({ "user_id": "user_001", "order_id": "ORD-1001", "reason": "does not fit" }),
        );

        let first = registry.invoke(call.clone()).await.expect("created");
        assert_eq!(first["operation"], "created");
        assert_eq!(first["status"], "submitted");

        let second = registry.invoke(call).await.expect("deduplicated");
        assert_eq!(second["operation"], "existing");
        assert_eq!(second["request_id"], first["request_id"]);
        assert_eq!(records.refund_request_count().await, 4);
    }

    #[tokio::test]
    async fn refund_for_someone_elses_order_is_rejected() {
        let (registry, _) = registry().await;
        let failure = registry
            .invoke(ToolCall::new(
                ToolName::CreateRefundRequest,
                json!({ "user_id": "user_002", "order_id": "ORD-1001", "reason": "x" }),
            ))
            .await
            .expect_err("wrong owner");
        assert_eq!(failure.kind, FailureKind::Fatal);
    }

    #[tokio::test]
    async fn ticket_tool_updates_the_open_ticket_for_the_order() {
        let (registry, records) = registry().await;
        let response = registry
            .invoke(ToolCall::new(
                ToolName::CreateOrUpdateTicket,
                json!({
                    "user_id": "user_003",
                    "order_id": "ORD-3001",
                    "sentiment": "neutral",
                    "summary": "refund: scroll wheel broke",
                }),
            ))
            .await
            .expect("ticket");

        assert_eq!(response["operation"], "updated");
        assert_eq!(response["ticket_id"], "TCK-3001");
        assert_eq!(records.ticket_count().await, 2);
    }

    #[tokio::test]
    async fn escalation_without_active_ticket_opens_an_escalated_one() {
        let (registry, records) = registry().await;
        let response = registry
            .invoke(ToolCall::new(
                ToolName::EscalateTicket,
                json!({ "user_id": "user_006", "reason": "no order on record" }),
            ))
            .await
            .expect("escalated");

        assert_eq!(response["operation"], "created");
        assert_eq!(response["escalation_level"], "tier2");

        let tickets = records.list_tickets(&UserId::new("user_006")).await.expect("tickets");
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].status, TicketStatus::Escalated);
    }

    #[tokio::test]
    async fn order_status_explains_shipping_state() {
        let (registry, _) = registry().await;
        let response = registry
            .invoke(ToolCall::new(
                ToolName::ExplainOrderStatus,
                json!({ "user_id": "user_007", "order_id": "ORD-7001" }),
            ))
            .await
            .expect("explained");
        assert_eq!(response["shipping_status"], "in_transit");
        assert!(response["message"].as_str().is_some_and(|message| message.contains("in transit")));
    }

    #[tokio::test]
    async fn fault_injection_fails_every_call_near_rate_one() {
        let (registry, records) = registry().await;
        let executor = FaultInjectingExecutor::new(
            registry,
            ErrorRate::new(0.999_999).expect("valid rate"),
            Some(7),
        );

        for _ in 0..20 {
            let failure = executor
                .invoke(ToolCall::new(
                    ToolName::CreateRefundRequest,
                    json!({ "user_id": "user_001", "order_id": "ORD-1001", "reason": "x" }),
                ))
                .await
                .expect_err("injected");
            assert!(failure.injected);
            assert_eq!(failure.kind, FailureKind::Recoverable);
        }
        assert_eq!(records.refund_request_count().await, 3);
    }

    #[tokio::test]
    async fn zero_rate_never_injects() {
        let (registry, _) = registry().await;
        let executor = FaultInjectingExecutor::new(registry, ErrorRate::ZERO, None);

        for _ in 0..20 {
            let response = executor
                .invoke(ToolCall::new(
                    ToolName::ExplainRefundStatus,
                    json!({ "user_id": "user_002" }),
                ))
                .await
                .expect("never injected");
            assert_eq!(response["refund_requests"].as_array().map(Vec::len), Some(2));
        }
    }

    #[tokio::test]
    async fn seeded_injection_is_reproducible() {
        async fn pattern(seed: u64) -> Vec<bool> {
            let (registry, _) = registry().await;
            let rate = ErrorRate::new(0.5).expect("rate");
            let executor = FaultInjectingExecutor::new(registry, rate, Some(seed));
            let mut outcomes = Vec::new();
            for _ in 0..16 {
                let result = executor
                    .invoke(ToolCall::new(
                        ToolName::ExplainRefundStatus,
                        json!({ "user_id": "user_004" }),
                    ))
                    .await;
                outcomes.push(result.is_err());
            }
            outcomes
        }

        assert_eq!(pattern(42).await, pattern(42).await);
    }
}
