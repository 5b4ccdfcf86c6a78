use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use opsdesk_core::domain::customer::UserId;
use opsdesk_core::domain::order::{Order, OrderId};
use opsdesk_core::domain::policy::{Policy, ScoredPolicy};
use opsdesk_core::domain::refund::RefundRequest;
use opsdesk_core::domain::ticket::SupportTicket;
use opsdesk_core::text;

use super::{PolicyStore, RecordsRepository, RecordsStore, RepositoryError, UserHistory};

/// Policy documents held in memory, ranked by token overlap with the query.
pub struct InMemoryPolicyStore {
    policies: RwLock<Vec<Policy>>,
    available: AtomicBool,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self { policies: RwLock::new(Vec::new()), available: AtomicBool::new(true) }
    }
}

impl InMemoryPolicyStore {
    pub async fn insert(&self, policy: Policy) {
        let mut policies = self.policies.write().await;
        policies.retain(|existing| existing.id != policy.id);
        policies.push(policy);
    }

    pub async fn len(&self) -> usize {
        self.policies.read().await.len()
    }

    /// Simulates the backing service going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Unavailable("policy store is not reachable".to_string()))
        }
    }
}

fn relevance(query_tokens: &[String], policy: &Policy) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }

    let mut document = format!("{} {} {}", policy.title, policy.text, policy.region.as_str());
    for category in &policy.excluded_categories {
        document.push(' ');
        document.push_str(category);
    }
    let document_tokens: BTreeSet<String> = text::tokenize(&document).into_iter().collect();

    let hits = query_tokens.iter().filter(|token| document_tokens.contains(*token)).count();
    hits as f32 / query_tokens.len() as f32
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn search(
        &self,
        query: &str,
        as_of: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ScoredPolicy>, RepositoryError> {
        self.ensure_available()?;

        let query_tokens = text::content_tokens(query);
        let policies = self.policies.read().await;

        let mut hits: Vec<ScoredPolicy> = policies
            .iter()
            .filter(|policy| as_of.map_or(true, |at| policy.is_active_at(at)))
            .map(|policy| ScoredPolicy {
                policy: policy.clone(),
                relevance: relevance(&query_tokens, policy),
            })
            .filter(|hit| hit.relevance > 0.0)
            .collect();

        hits.sort_by(|left, right| {
            right
                .relevance
                .total_cmp(&left.relevance)
                .then_with(|| left.policy.id.0.cmp(&right.policy.id.0))
        });
        hits.truncate(limit);

        Ok(hits)
    }
}

/// Orders, refund requests and tickets held in memory. Serves both the read
/// path used by the records stage and the write path used by tools.
pub struct InMemoryRecordsStore {
    orders: RwLock<HashMap<String, Order>>,
    refund_requests: RwLock<HashMap<String, RefundRequest>>,
    tickets: RwLock<HashMap<String, SupportTicket>>,
    available: AtomicBool,
}

impl Default for InMemoryRecordsStore {
    fn default() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            refund_requests: RwLock::new(HashMap::new()),
            tickets: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryRecordsStore {
    pub async fn insert_order(&self, order: Order) {
        let mut orders = self.orders.write().await;
        orders.insert(order.order_id.0.clone(), order);
    }

    pub async fn refund_request_count(&self) -> usize {
        self.refund_requests.read().await.len()
    }

    pub async fn ticket_count(&self) -> usize {
        self.tickets.read().await.len()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Unavailable("records store is not reachable".to_string()))
        }
    }
}

fn ensure_well_formed(user_id: &UserId) -> Result<(), RepositoryError> {
    if user_id.is_well_formed() {
        Ok(())
    } else {
        Err(RepositoryError::InvalidUserId(user_id.0.clone()))
    }
}

#[async_trait::async_trait]
impl RecordsStore for InMemoryRecordsStore {
    async fn fetch(&self, user_id: &UserId) -> Result<UserHistory, RepositoryError> {
        self.ensure_available()?;
        ensure_well_formed(user_id)?;

        let orders = self.orders.read().await;
        let refund_requests = self.refund_requests.read().await;
        let tickets = self.tickets.read().await;

        Ok(UserHistory {
            orders: orders.values().filter(|order| &order.user_id == user_id).cloned().collect(),
            refund_requests: refund_requests
                .values()
                .filter(|request| &request.user_id == user_id)
                .cloned()
                .collect(),
            tickets: tickets
                .values()
                .filter(|ticket| &ticket.user_id == user_id)
                .cloned()
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl RecordsRepository for InMemoryRecordsStore {
    async fn find_order(&self, id: &OrderId) -> Result<Option<Order>, RepositoryError> {
        self.ensure_available()?;
        let orders = self.orders.read().await;
        Ok(orders.get(&id.0).cloned())
    }

    async fn list_refund_requests(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<RefundRequest>, RepositoryError> {
        self.ensure_available()?;
        let refund_requests = self.refund_requests.read().await;
        Ok(refund_requests
            .values()
            .filter(|request| &request.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save_refund_request(&self, request: RefundRequest) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        let mut refund_requests = self.refund_requests.write().await;
        refund_requests.insert(request.request_id.0.clone(), request);
        Ok(())
    }

    async fn list_tickets(&self, user_id: &UserId) -> Result<Vec<SupportTicket>, RepositoryError> {
        self.ensure_available()?;
        let tickets = self.tickets.read().await;
        Ok(tickets.values().filter(|ticket| &ticket.user_id == user_id).cloned().collect())
    }

    async fn save_ticket(&self, ticket: SupportTicket) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        let mut tickets = self.tickets.write().await;
        tickets.insert(ticket.ticket_id.0.clone(), ticket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use opsdesk_core::domain::classification::Sentiment;
    use opsdesk_core::domain::customer::UserId;
    use opsdesk_core::domain::order::{Order, OrderId, ShippingStatus};
    use opsdesk_core::domain::policy::{Policy, PolicyId, Region};
    use opsdesk_core::domain::ticket::{SupportTicket, TicketId, TicketStatus};

    use crate::repositories::{
        InMemoryPolicyStore, InMemoryRecordsStore, PolicyStore, RecordsRepository, RecordsStore,
        RepositoryError,
    };

    fn policy(id: &str, text: &str, expired: bool) -> Policy {
        let now = Utc::now();
        Policy {
            id: PolicyId(id.to_string()),
            title: format!("{id} policy"),
            text: text.to_string(),
            region: Region::Us,
            version: "v1".to_string(),
            effective_from: now - Duration::days(100),
            effective_until: expired.then(|| now - Duration::days(1)),
            refund_window_days: 30,
            excluded_categories: Vec::new(),
        }
    }

    fn order(id: &str, user: &str) -> Order {
        Order {
            order_id: OrderId(id.to_string()),
            user_id: UserId::new(user),
            product: "Desk Lamp".to_string(),
            category: "home".to_string(),
            purchase_date: Utc::now() - Duration::days(3),
            shipping_status: ShippingStatus::Shipped,
            amount: Decimal::new(2999, 2),
            currency: "USD".to_string(),
            shipping_country: "US".to_string(),
        }
    }

    #[tokio::test]
    async fn search_ranks_by_token_overlap() {
        let store = InMemoryPolicyStore::default();
        store.insert(policy("returns", "refund accepted for any product", false)).await;
        store.insert(policy("warranty", "warranty repair for product defects", false)).await;
        store.insert(policy("shipping", "shipping times and carriers", false)).await;

        let hits = store.search("refund product", Some(Utc::now()), 10).await.expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].policy.id.0, "returns");
        assert!(hits[0].relevance > hits[1].relevance);
    }

    #[tokio::test]
    async fn search_with_as_of_hides_expired_policies() {
        let store = InMemoryPolicyStore::default();
        store.insert(policy("current", "refund within 30 days", false)).await;
        store.insert(policy("legacy", "refund within 10 days", true)).await;

        let active = store.search("refund", Some(Utc::now()), 10).await.expect("search");
        let all = store.search("refund", None, 10).await.expect("search");

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].policy.id.0, "current");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_policy_store_returns_error() {
        let store = InMemoryPolicyStore::default();
        store.set_available(false);

        let error = store.search("refund", None, 10).await.expect_err("store is down");
        assert!(matches!(error, RepositoryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fetch_returns_only_the_users_records() {
        let store = InMemoryRecordsStore::default();
        store.insert_order(order("ORD-1", "user_001")).await;
        store.insert_order(order("ORD-2", "user_002")).await;

        let history = store.fetch(&UserId::new("user_001")).await.expect("fetch");
        assert_eq!(history.orders.len(), 1);
        assert_eq!(history.orders[0].order_id.0, "ORD-1");

        let unknown = store.fetch(&UserId::new("user_999")).await.expect("fetch unknown");
        assert!(unknown.orders.is_empty());
    }

    #[tokio::test]
    async fn fetch_rejects_malformed_user_ids() {
        let store = InMemoryRecordsStore::default();
        let error = store.fetch(&UserId::new("user 001")).await.expect_err("malformed id");
        assert_eq!(error, RepositoryError::InvalidUserId("user 001".to_string()));
    }

    #[tokio::test]
    async fn ticket_save_then_list_round_trip() {
        let store = InMemoryRecordsStore::default();
        let now = Utc::now();
        let ticket = SupportTicket {
            ticket_id: TicketId("TCK-1".to_string()),
            user_id: UserId::new("user_001"),
            order_id: None,
            status: TicketStatus::Open,
            sentiment: Sentiment::Neutral,
            summary: "question about delivery".to_string(),
            escalation_level: None,
            created_at: now,
            updated_at: now,
        };

        store.save_ticket(ticket.clone()).await.expect("save ticket");
        let tickets = store.list_tickets(&UserId::new("user_001")).await.expect("list tickets");

        assert_eq!(tickets, vec![ticket]);
        assert_eq!(store.ticket_count().await, 1);
    }
}
