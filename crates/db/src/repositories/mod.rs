use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use opsdesk_core::domain::customer::UserId;
use opsdesk_core::domain::order::{Order, OrderId};
use opsdesk_core::domain::policy::ScoredPolicy;
use opsdesk_core::domain::refund::RefundRequest;
use opsdesk_core::domain::ticket::SupportTicket;

pub mod memory;

pub use memory::{InMemoryPolicyStore, InMemoryRecordsStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid user id `{0}`")]
    InvalidUserId(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Everything on file for one user, unordered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserHistory {
    pub orders: Vec<Order>,
    pub refund_requests: Vec<RefundRequest>,
    pub tickets: Vec<SupportTicket>,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Ranked candidates for `query`, best first. With `as_of` set, only
    /// policies active at that instant are returned.
    async fn search(
        &self,
        query: &str,
        as_of: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ScoredPolicy>, RepositoryError>;
}

#[async_trait]
pub trait RecordsStore: Send + Sync {
    async fn fetch(&self, user_id: &UserId) -> Result<UserHistory, RepositoryError>;
}

/// Write side of the records store. Only tool implementations use it.
#[async_trait]
pub trait RecordsRepository: Send + Sync {
    async fn find_order(&self, id: &OrderId) -> Result<Option<Order>, RepositoryError>;

    async fn list_refund_requests(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<RefundRequest>, RepositoryError>;

    async fn save_refund_request(&self, request: RefundRequest) -> Result<(), RepositoryError>;

    async fn list_tickets(&self, user_id: &UserId) -> Result<Vec<SupportTicket>, RepositoryError>;

    async fn save_ticket(&self, ticket: SupportTicket) -> Result<(), RepositoryError>;
}
