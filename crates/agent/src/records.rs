use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use opsdesk_core::config::PipelineConfig;
use opsdesk_core::context::{RequestContext, UserRecords};
use opsdesk_core::errors::StageFailure;
use opsdesk_core::pipeline::Stage;
use opsdesk_db::{RecordsStore, RepositoryError, UserHistory};

use crate::stage::{bounded, Agent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLimits {
    pub max_orders: usize,
    pub max_refund_requests: usize,
    pub max_tickets: usize,
}

impl RecordLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_orders: config.max_orders,
            max_refund_requests: config.max_refund_requests,
            max_tickets: config.max_tickets,
        }
    }
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// A3: gathers the customer's orders, refund requests and tickets.
pub struct RecordsAgent {
    store: Arc<dyn RecordsStore>,
    limits: RecordLimits,
    leaf_timeout: Duration,
}

impl RecordsAgent {
    pub fn new(store: Arc<dyn RecordsStore>, limits: RecordLimits, leaf_timeout: Duration) -> Self {
        Self { store, limits, leaf_timeout }
    }
}

/// Newest first within each list, then truncated to the limits. Ties fall
/// back to the identifier so output order never depends on store order.
pub fn aggregate(history: UserHistory, limits: RecordLimits) -> UserRecords {
    let UserHistory { mut orders, mut refund_requests, mut tickets } = history;

    orders.sort_by(|left, right| {
        right
            .purchase_date
            .cmp(&left.purchase_date)
            .then_with(|| left.order_id.0.cmp(&right.order_id.0))
    });
    refund_requests.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| left.request_id.0.cmp(&right.request_id.0))
    });
    tickets.sort_by(|left, right| {
        right
            .updated_at
            .cmp(&left.updated_at)
            .then_with(|| left.ticket_id.0.cmp(&right.ticket_id.0))
    });

    orders.truncate(limits.max_orders);
    refund_requests.truncate(limits.max_refund_requests);
    tickets.truncate(limits.max_tickets);

    UserRecords { orders, refund_requests, tickets, degraded: None }
}

#[async_trait]
impl Agent for RecordsAgent {
    type Output = UserRecords;

    fn stage(&self) -> Stage {
        Stage::Records
    }

    async fn run(&self, ctx: &RequestContext) -> Result<UserRecords, StageFailure> {
        let user_id = ctx.user_id();
        if !user_id.is_well_formed() {
            return Err(StageFailure::fatal(
                Stage::Records,
                format!("user id `{user_id}` is malformed"),
            ));
        }

        let history = match bounded(self.leaf_timeout, self.store.fetch(user_id)).await {
            None => {
                return Err(StageFailure::recoverable(
                    Stage::Records,
                    format!("records fetch timed out after {}ms", self.leaf_timeout.as_millis()),
                ))
            }
            Some(Err(error @ RepositoryError::InvalidUserId(_))) => {
                return Err(StageFailure::fatal(Stage::Records, error.to_string()))
            }
            Some(Err(error)) => {
                return Err(StageFailure::recoverable(Stage::Records, error.to_string()))
            }
            Some(Ok(history)) => history,
        };

        let records = aggregate(history, self.limits);
        tracing::debug!(
            event_name = "records.fetch.completed",
            correlation_id = %ctx.request_id(),
            user_id = %user_id,
            orders = records.orders.len(),
            refund_requests = records.refund_requests.len(),
            tickets = records.tickets.len(),
            "customer records aggregated"
        );
        Ok(records)
    }
}
